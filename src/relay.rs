//! Token redemption and the subprocess-to-client streaming pipeline.
//!
//! A redemption validates the token, opens the upstream stream and waits for
//! its first item before any header is committed, so early failures still get
//! a structured error. After that, a pump task moves chunks into a bounded
//! channel that the response body drains. A slow client blocks the pump, and a
//! client that goes away closes the channel, which makes the pump drop (and so
//! cancel) the upstream.

use std::{io, sync::Arc};

use axum::{
    body::Body,
    http::{
        HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::{
    error::{RelayError, ResolveError},
    format::{FormatSelector, attachment_filename, build_content_disposition},
    source::{ByteStream, MediaInfo, MediaSource},
    store::{Lookup, MintedToken, TokenStore, token_label},
};

#[derive(Clone)]
pub struct DownloadRelay {
    store: Arc<TokenStore>,
    source: Arc<dyn MediaSource>,
    buffer_chunks: usize,
}

/// A redemption that is ready to stream.
pub struct Redemption {
    pub filename: String,
    pub body: Body,
}

impl IntoResponse for Redemption {
    fn into_response(self) -> Response {
        let disposition = HeaderValue::from_str(&build_content_disposition(&self.filename))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

        (
            [
                (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
                (CONTENT_DISPOSITION, disposition),
            ],
            self.body,
        )
            .into_response()
    }
}

#[derive(Debug)]
enum StreamOutcome {
    Completed { bytes: u64 },
    ClientGone { bytes: u64 },
    Aborted { bytes: u64, error: io::Error },
}

impl DownloadRelay {
    pub fn new(store: Arc<TokenStore>, source: Arc<dyn MediaSource>, buffer_chunks: usize) -> Self {
        Self {
            store,
            source,
            buffer_chunks: buffer_chunks.max(1),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Resolves `url` and binds a fresh token to the result.
    pub async fn resolve_and_mint(&self, url: &str) -> Result<(MediaInfo, MintedToken), ResolveError> {
        let info = self.source.resolve(url).await?;
        let minted = self.store.mint(info.download_target());
        info!(
            token = %token_label(&minted.token),
            media_id = %info.id,
            encodings = info.encodings.len(),
            "resolved media and minted token"
        );
        Ok((info, minted))
    }

    pub async fn redeem(&self, token: &str, format: Option<&str>) -> Result<Redemption, RelayError> {
        let label = token_label(token).to_string();

        let record = match self.store.lookup(token) {
            Lookup::Live(record) => record,
            Lookup::Expired => {
                info!(token = %label, "redemption rejected: token expired");
                return Err(RelayError::TokenExpired);
            }
            Lookup::NotFound => {
                info!(token = %label, "redemption rejected: unknown token");
                return Err(RelayError::TokenNotFound);
            }
        };

        let selector = match FormatSelector::parse(format)? {
            FormatSelector::Encoding(id) if !record.has_encoding(&id) => {
                info!(token = %label, encoding = %id, "redemption rejected: unknown encoding");
                return Err(RelayError::InvalidFormat(id));
            }
            FormatSelector::Encoding(id) => FormatSelector::Encoding(id),
            preset => record
                .pinned_encoding(preset.as_ytdlp())
                .map(|id| FormatSelector::Encoding(id.to_string()))
                .unwrap_or(preset),
        };
        let filename = attachment_filename(
            &record.target.title,
            record.container_for(selector.as_ytdlp()),
        );

        let mut upstream = self
            .source
            .open_stream(&record.target.resolved_url, &selector)
            .await
            .map_err(|error| {
                warn!(token = %label, "could not open upstream: {error}");
                RelayError::Upstream(error.to_string())
            })?;

        let first = match upstream.next().await {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(error)) => {
                warn!(token = %label, "upstream failed before first byte: {error}");
                return Err(RelayError::Upstream(error.to_string()));
            }
            None => None,
        };

        info!(
            token = %label,
            selector = selector.as_ytdlp(),
            %filename,
            "streaming download"
        );

        let (tx, rx) = mpsc::channel(self.buffer_chunks);
        tokio::spawn(async move {
            match pump(first, upstream, tx).await {
                StreamOutcome::Completed { bytes } => {
                    info!(token = %label, bytes, "download completed")
                }
                StreamOutcome::ClientGone { bytes } => {
                    info!(token = %label, bytes, "client disconnected, upstream cancelled")
                }
                StreamOutcome::Aborted { bytes, error } => {
                    warn!(token = %label, bytes, "upstream failed mid-stream: {error}")
                }
            }
        });

        Ok(Redemption {
            filename,
            body: Body::from_stream(ReceiverStream::new(rx)),
        })
    }
}

/// Forwards upstream chunks until upstream ends, fails, or the receiver is
/// dropped. Returning drops `upstream`.
async fn pump(
    first: Option<Bytes>,
    mut upstream: ByteStream,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> StreamOutcome {
    let mut bytes = 0u64;

    if let Some(chunk) = first {
        let len = chunk.len() as u64;
        if tx.send(Ok(chunk)).await.is_err() {
            return StreamOutcome::ClientGone { bytes };
        }
        bytes += len;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => return StreamOutcome::ClientGone { bytes },
            next = upstream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                if tx.send(Ok(chunk)).await.is_err() {
                    return StreamOutcome::ClientGone { bytes };
                }
                bytes += len;
            }
            Some(Err(error)) => {
                // makes the body error out, which aborts the connection
                let forwarded = io::Error::new(error.kind(), error.to_string());
                let _ = tx.send(Err(forwarded)).await;
                return StreamOutcome::Aborted { bytes, error };
            }
            None => return StreamOutcome::Completed { bytes },
        }
    }
}
