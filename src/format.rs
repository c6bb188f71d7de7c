//! Format selection and attachment naming.

use crate::error::RelayError;

const MAX_TITLE_CHARS: usize = 120;
const MAX_ENCODING_ID_CHARS: usize = 64;
const MAX_EXTENSION_CHARS: usize = 10;
const FALLBACK_TITLE: &str = "download";
const FALLBACK_EXTENSION: &str = "bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelector {
    BestQuality,
    BestAudio,
    BestVideo,
    Encoding(String),
}

impl FormatSelector {
    /// Absent or blank input means best quality.
    pub fn parse(input: Option<&str>) -> Result<Self, RelayError> {
        let Some(value) = input.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(Self::BestQuality);
        };

        match value {
            "best-quality" | "best" => Ok(Self::BestQuality),
            "best-audio-only" | "bestaudio" | "audio" => Ok(Self::BestAudio),
            "best-video-only" | "bestvideo" | "video" => Ok(Self::BestVideo),
            id if is_encoding_id(id) => Ok(Self::Encoding(id.to_string())),
            other => Err(RelayError::InvalidFormat(other.to_string())),
        }
    }

    /// Value handed to `yt-dlp -f`.
    pub fn as_ytdlp(&self) -> &str {
        match self {
            Self::BestQuality => "best",
            Self::BestAudio => "bestaudio",
            Self::BestVideo => "bestvideo",
            Self::Encoding(id) => id,
        }
    }
}

fn is_encoding_id(value: &str) -> bool {
    value.len() <= MAX_ENCODING_ID_CHARS
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '='))
}

/// Keeps ASCII word characters and hyphens, joins whitespace runs with `_`.
pub fn sanitize_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|&c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-') || c.is_whitespace())
        .collect();
    let mut joined = kept.split_whitespace().collect::<Vec<_>>().join("_");
    joined.truncate(MAX_TITLE_CHARS);

    if joined.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        joined
    }
}

fn sanitize_extension(container: &str) -> String {
    let ext: String = container
        .trim()
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_EXTENSION_CHARS)
        .collect::<String>()
        .to_ascii_lowercase();

    if ext.is_empty() {
        FALLBACK_EXTENSION.to_string()
    } else {
        ext
    }
}

pub fn attachment_filename(title: &str, container: &str) -> String {
    format!("{}.{}", sanitize_title(title), sanitize_extension(container))
}

pub fn build_content_disposition(filename: &str) -> String {
    format!("attachment; filename=\"{filename}\"")
}
