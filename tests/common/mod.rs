#![allow(dead_code)]

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures::{StreamExt, stream};
use parking_lot::Mutex;

use media_relay::{
    clock::ManualClock,
    error::ResolveError,
    format::FormatSelector,
    relay::DownloadRelay,
    source::{ByteStream, Encoding, MediaInfo, MediaSource},
    store::{TokenStore, UuidEntropy},
};

pub const TTL: Duration = Duration::from_secs(600);
pub const BUFFER_CHUNKS: usize = 4;

#[derive(Debug, Clone, Copy)]
pub enum Upstream {
    /// `count` chunks of `size` bytes, then a clean end.
    Chunks { count: usize, size: usize },
    /// Fails before yielding anything.
    FailFirst,
    /// `chunks` chunks, then an error.
    FailAfter { chunks: usize },
    /// Never ends on its own.
    Endless,
}

/// Flags shared with a stub stream so tests can observe it.
#[derive(Debug, Default)]
pub struct Probe {
    pub produced: AtomicUsize,
    pub dropped: AtomicBool,
}

struct DropFlag(Arc<Probe>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.dropped.store(true, Ordering::SeqCst);
    }
}

pub struct StubSource {
    pub info: MediaInfo,
    pub upstream: Mutex<Upstream>,
    pub resolve_error: Mutex<Option<String>>,
    pub opened: AtomicUsize,
    pub probes: Mutex<Vec<Arc<Probe>>>,
    pub selectors: Mutex<Vec<String>>,
}

impl StubSource {
    pub fn new(upstream: Upstream) -> Self {
        Self {
            info: sample_info(),
            upstream: Mutex::new(upstream),
            resolve_error: Mutex::new(None),
            opened: AtomicUsize::new(0),
            probes: Mutex::new(Vec::new()),
            selectors: Mutex::new(Vec::new()),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn last_probe(&self) -> Arc<Probe> {
        self.probes.lock().last().cloned().expect("no stream was opened")
    }
}

pub fn sample_info() -> MediaInfo {
    MediaInfo {
        id: "abc123".to_string(),
        title: "Sample Clip: Part 1/2".to_string(),
        duration: Some(42.0),
        thumbnail: Some("https://img.example.com/abc123.jpg".to_string()),
        author: Some("Example Channel".to_string()),
        canonical_url: "https://video.example.com/watch?v=abc123".to_string(),
        default_container: "mp4".to_string(),
        encodings: vec![
            Encoding {
                id: "22".to_string(),
                container: "mp4".to_string(),
                quality: "720p".to_string(),
                has_video: true,
                has_audio: true,
            },
            Encoding {
                id: "251".to_string(),
                container: "webm".to_string(),
                quality: "130 kbps".to_string(),
                has_video: false,
                has_audio: true,
            },
        ],
    }
}

pub fn chunk(index: usize, size: usize) -> Bytes {
    Bytes::from(vec![(index % 251) as u8; size])
}

#[async_trait]
impl MediaSource for StubSource {
    async fn resolve(&self, _url: &str) -> Result<MediaInfo, ResolveError> {
        match self.resolve_error.lock().clone() {
            Some(message) => Err(ResolveError::Failed(message)),
            None => Ok(self.info.clone()),
        }
    }

    async fn open_stream(&self, _url: &str, selector: &FormatSelector) -> io::Result<ByteStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.selectors.lock().push(selector.as_ytdlp().to_string());

        let probe = Arc::new(Probe::default());
        self.probes.lock().push(Arc::clone(&probe));
        let upstream = *self.upstream.lock();

        let flag = DropFlag(Arc::clone(&probe));
        let stream = stream::unfold((0usize, flag), move |(index, flag)| async move {
            let item = match upstream {
                Upstream::Chunks { count, .. } if index >= count => return None,
                Upstream::Chunks { size, .. } => Ok(chunk(index, size)),
                Upstream::FailFirst => {
                    if index > 0 {
                        return None;
                    }
                    Err(io::Error::other("stub failed to start"))
                }
                Upstream::FailAfter { chunks } if index == chunks => {
                    Err(io::Error::other("stub broke mid-stream"))
                }
                Upstream::FailAfter { chunks } if index > chunks => return None,
                Upstream::FailAfter { .. } => Ok(chunk(index, 1024)),
                Upstream::Endless => {
                    tokio::task::yield_now().await;
                    Ok(chunk(index, 4096))
                }
            };
            flag.0.produced.fetch_add(1, Ordering::SeqCst);
            Some((item, (index + 1, flag)))
        });

        Ok(stream.boxed())
    }
}

pub struct Harness {
    pub source: Arc<StubSource>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<TokenStore>,
    pub relay: DownloadRelay,
}

pub fn harness(upstream: Upstream) -> Harness {
    let source = Arc::new(StubSource::new(upstream));
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    ));
    let store = Arc::new(TokenStore::with_parts(
        TTL,
        Duration::from_secs(3600),
        clock.clone(),
        Arc::new(UuidEntropy),
    ));
    let relay = DownloadRelay::new(Arc::clone(&store), source.clone(), BUFFER_CHUNKS);

    Harness {
        source,
        clock,
        store,
        relay,
    }
}

/// Polls `probe` until the stub stream has been dropped.
pub async fn wait_for_drop(probe: &Probe, within: Duration) -> bool {
    tokio::time::timeout(within, async {
        while !probe.dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
