//! The resolution stage seen from the relay: something that can describe a
//! source URL and open a byte stream for one of its encodings.

use std::{io, pin::Pin};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;

use crate::{
    error::ResolveError,
    format::FormatSelector,
    store::DownloadTarget,
};

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Encoding {
    pub id: String,
    pub container: String,
    pub quality: String,
    pub has_video: bool,
    pub has_audio: bool,
}

impl Encoding {
    fn is_combined(&self) -> bool {
        self.has_video && self.has_audio
    }

    fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }

    fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub author: Option<String>,
    #[serde(skip)]
    pub canonical_url: String,
    #[serde(skip)]
    pub default_container: String,
    /// Ordered best first within each kind.
    #[serde(rename = "formats")]
    pub encodings: Vec<Encoding>,
}

impl MediaInfo {
    /// What a token for this media is bound to. Each preset is pinned to the
    /// first encoding of its kind, so the streamed file and its extension
    /// always agree.
    pub fn download_target(&self) -> DownloadTarget {
        let mut target = DownloadTarget::new(
            self.canonical_url.clone(),
            self.title.clone(),
            self.default_container.clone(),
        );

        for encoding in &self.encodings {
            target
                .containers
                .entry(encoding.id.clone())
                .or_insert_with(|| encoding.container.clone());
        }

        let presets: [(FormatSelector, fn(&Encoding) -> bool); 3] = [
            (FormatSelector::BestQuality, Encoding::is_combined),
            (FormatSelector::BestAudio, Encoding::is_audio_only),
            (FormatSelector::BestVideo, Encoding::is_video_only),
        ];
        for (selector, is_match) in presets {
            if let Some(best) = self.encodings.iter().find(|encoding| is_match(encoding)) {
                target
                    .presets
                    .insert(selector.as_ytdlp().to_string(), best.id.clone());
            }
        }

        target
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<MediaInfo, ResolveError>;

    /// Starts fetching `url` in the selected encoding. Dropping the stream
    /// must stop the underlying transfer.
    async fn open_stream(&self, url: &str, selector: &FormatSelector) -> io::Result<ByteStream>;
}
