//! Token-gated media download relay.
//!
//! A source URL is resolved through yt-dlp into metadata plus a short-lived
//! token. Redeeming the token streams the chosen encoding back to the client
//! without exposing the source URL.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod format;
pub mod relay;
pub mod source;
pub mod store;
pub mod sweeper;
pub mod ytdlp;
