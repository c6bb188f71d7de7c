//! yt-dlp backed [`MediaSource`].

use std::{
    cmp::Ordering,
    collections::HashSet,
    io::{self, ErrorKind},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::{
    config::RelayConfig,
    error::ResolveError,
    format::FormatSelector,
    source::{ByteStream, Encoding, MediaInfo, MediaSource},
};

const STREAM_CHUNK_BYTES: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    creator: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    ext: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f32>,
    format_note: Option<String>,
    tbr: Option<f32>,
    abr: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
    leading_args: Vec<String>,
    resolve_timeout: Duration,
}

impl YtDlp {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            resolve_timeout: Duration::from_secs(crate::config::DEFAULT_RESOLVE_TIMEOUT_SECONDS),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        let mut parts = config.yt_dlp_command.iter().cloned();
        let program = parts.next().unwrap_or_else(|| "yt-dlp".to_string());
        Self::new(program)
            .with_leading_args(parts)
            .with_resolve_timeout(config.resolve_timeout)
    }

    /// Arguments placed before the generated ones, e.g. `-m yt_dlp` when the
    /// program is `python3`.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resolve_timeout(mut self, resolve_timeout: Duration) -> Self {
        self.resolve_timeout = resolve_timeout;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, ResolveError> {
        let mut command = self.command();
        command.args(args);
        let output = timeout(self.resolve_timeout, command.output())
            .await
            .map_err(|_| ResolveError::Timeout)?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ResolveError::ToolMissing(self.program.clone())
                } else {
                    ResolveError::Failed(format!("could not run yt-dlp: {error}"))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolveError::Failed(run_error_message(&stderr, output.status)));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaSource for YtDlp {
    async fn resolve(&self, url: &str) -> Result<MediaInfo, ResolveError> {
        let output = self
            .run(vec![
                "-J".to_string(),
                "--no-playlist".to_string(),
                "--no-warnings".to_string(),
                "--no-check-certificates".to_string(),
                "--".to_string(),
                url.to_string(),
            ])
            .await?;

        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout)?;
        Ok(into_media_info(info, url))
    }

    async fn open_stream(&self, url: &str, selector: &FormatSelector) -> io::Result<ByteStream> {
        let mut child = self
            .command()
            .args([
                "--no-playlist",
                "--no-warnings",
                "--no-progress",
                "--quiet",
                "--no-part",
                "--no-check-certificates",
                "-f",
                selector.as_ytdlp(),
                "-o",
                "-",
                "--",
                url,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    io::Error::new(
                        ErrorKind::NotFound,
                        format!("yt-dlp is not installed ({})", self.program),
                    )
                } else {
                    error
                }
            })?;

        debug!(selector = selector.as_ytdlp(), pid = ?child.id(), "spawned yt-dlp stream");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("yt-dlp stdout was not captured"))?;
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(collect_stderr(pipe)));

        Ok(child_stream(ChildOutput {
            child,
            stdout: ReaderStream::with_capacity(stdout, STREAM_CHUNK_BYTES),
            stderr,
        }))
    }
}

/// Owns the child so that dropping the stream kills it.
struct ChildOutput {
    child: Child,
    stdout: ReaderStream<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
}

impl ChildOutput {
    async fn finish(mut self) -> io::Result<()> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(run_error_message(&stderr, status)))
        }
    }
}

fn child_stream(output: ChildOutput) -> ByteStream {
    stream::unfold(Some(output), |state| async move {
        let mut state = state?;
        match state.stdout.next().await {
            Some(Ok(chunk)) => Some((Ok(chunk), Some(state))),
            Some(Err(error)) => Some((Err(error), None)),
            None => match state.finish().await {
                Ok(()) => None,
                Err(error) => Some((Err(error), None)),
            },
        }
    })
    .boxed()
}

async fn collect_stderr(pipe: ChildStderr) -> String {
    let mut tail: Vec<String> = Vec::new();
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("[yt-dlp] {line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
            Ok(None) => break,
            Err(error) => {
                warn!("could not read yt-dlp stderr: {error}");
                break;
            }
        }
    }
    tail.join("\n")
}

fn run_error_message(stderr: &str, status: ExitStatus) -> String {
    let Some(line) = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
    else {
        return format!("yt-dlp exited with {status}");
    };

    let message = line.strip_prefix("ERROR:").map(str::trim).unwrap_or(line);
    if message.to_ascii_lowercase().contains("unsupported url") {
        "unsupported or invalid URL for download".to_string()
    } else {
        message.to_string()
    }
}

fn into_media_info(info: YtDlpVideoInfo, requested_url: &str) -> MediaInfo {
    let encodings = build_encodings(&info.formats);
    let default_container = info
        .ext
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
        .or_else(|| encodings.first().map(|encoding| encoding.container.clone()))
        .unwrap_or_else(|| "mp4".to_string());

    MediaInfo {
        id: info.id.unwrap_or_default(),
        title: info
            .title
            .as_deref()
            .and_then(non_empty)
            .unwrap_or("Untitled")
            .to_string(),
        duration: info.duration,
        thumbnail: info.thumbnail,
        author: info.uploader.or(info.channel).or(info.creator),
        canonical_url: info
            .webpage_url
            .or(info.original_url)
            .unwrap_or_else(|| requested_url.to_string()),
        default_container,
        encodings,
    }
}

fn build_encodings(formats: &[YtDlpFormat]) -> Vec<Encoding> {
    let mut video: Vec<(u32, f32, f32, Encoding)> = Vec::new();
    let mut audio: Vec<(f32, f32, Encoding)> = Vec::new();

    for item in formats.iter().filter(|item| is_downloadable(item)) {
        let (has_video, has_audio) = stream_kinds(item);
        let container = item.ext.clone().unwrap_or_else(|| "mp4".to_string());

        if has_video {
            let quality = video_quality(item);
            video.push((
                item.height.unwrap_or_default(),
                item.fps.unwrap_or_default(),
                item.tbr.unwrap_or_default(),
                Encoding {
                    id: item.format_id.clone(),
                    container,
                    quality,
                    has_video,
                    has_audio,
                },
            ));
        } else {
            let bitrate = item.abr.or(item.tbr).unwrap_or_default();
            let quality = if bitrate > 0.0 {
                format!("{} kbps", bitrate.round() as u32)
            } else {
                item.format_note.clone().unwrap_or_else(|| "audio".to_string())
            };
            audio.push((
                item.abr.unwrap_or_default(),
                item.tbr.unwrap_or_default(),
                Encoding {
                    id: item.format_id.clone(),
                    container,
                    quality,
                    has_video,
                    has_audio,
                },
            ));
        }
    }

    video.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
            .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal))
    });
    audio.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
    });

    let mut seen_ids = HashSet::new();
    video
        .into_iter()
        .map(|(_, _, _, encoding)| encoding)
        .chain(audio.into_iter().map(|(_, _, encoding)| encoding))
        .filter(|encoding| seen_ids.insert(encoding.id.clone()))
        .collect()
}

fn video_quality(item: &YtDlpFormat) -> String {
    let fps_suffix = item
        .fps
        .filter(|fps| *fps > 30.0)
        .map(|fps| (fps.round() as u32).to_string())
        .unwrap_or_default();

    item.height
        .map(|height| format!("{height}p{fps_suffix}"))
        .or_else(|| item.format_note.clone())
        .unwrap_or_else(|| "video".to_string())
}

fn has_codec(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if value != "none")
}

/// Entries without any codec information are plain files with both streams.
fn stream_kinds(format: &YtDlpFormat) -> (bool, bool) {
    if format.vcodec.is_none() && format.acodec.is_none() {
        return (true, true);
    }
    (
        has_codec(format.vcodec.as_deref()),
        has_codec(format.acodec.as_deref()),
    )
}

fn is_downloadable(format: &YtDlpFormat) -> bool {
    if format.ext.as_deref() == Some("mhtml") {
        return false;
    }
    let (has_video, has_audio) = stream_kinds(format);
    has_video || has_audio
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
