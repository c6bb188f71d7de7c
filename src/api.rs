use std::{collections::HashSet, io, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, Method, header::CONTENT_DISPOSITION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::ApiError, relay::DownloadRelay, source::MediaInfo};

#[derive(Clone)]
pub struct AppState {
    relay: DownloadRelay,
}

impl AppState {
    pub fn new(relay: DownloadRelay) -> Self {
        Self { relay }
    }
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    success: bool,
    token: String,
    expires_at: DateTime<Utc>,
    download_path: String,
    #[serde(flatten)]
    media: MediaInfo,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    format: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(fetch_info))
        .route("/api/download/{token}", get(download))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "live_tokens": state.relay.store().live_len(),
    }))
}

async fn fetch_info(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> Result<Json<InfoResponse>, ApiError> {
    let Json(payload) = payload?;
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::invalid_url("Enter a URL to resolve."));
    }
    if !is_valid_source_url(url) {
        return Err(ApiError::invalid_url(
            "Unsupported URL. Use an http(s) link to a media page.",
        ));
    }

    let (media, minted) = state.relay.resolve_and_mint(url).await.map_err(|error| {
        warn!("could not resolve {url:?}: {error}");
        ApiError::from(error)
    })?;

    Ok(Json(InfoResponse {
        success: true,
        download_path: format!("/api/download/{}", minted.token),
        token: minted.token,
        expires_at: minted.expires_at,
        media,
    }))
}

async fn download(
    State(state): State<AppState>,
    Path(token): Path<String>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let redemption = state.relay.redeem(&token, query.format.as_deref()).await?;
    Ok(redemption.into_response())
}

/// Serves `app` until `shutdown` is cancelled, then gives open connections
/// `grace` to finish before returning anyway.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> io::Result<()> {
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result,
        _ = shutdown.cancelled() => {}
    }

    match tokio::time::timeout(grace, server).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs_f64(),
                "open connections outlived the shutdown grace period, dropping them"
            );
            Ok(())
        }
    }
}

pub fn is_valid_source_url(input: &str) -> bool {
    let Ok(parsed) = Url::parse(input) else {
        return false;
    };

    matches!(parsed.scheme(), "http" | "https")
        && parsed.host_str().is_some_and(|host| !host.is_empty())
}

pub fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let origins = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to development origins.");
        vec![
            "http://127.0.0.1:5173".to_string(),
            "http://localhost:5173".to_string(),
        ]
    } else {
        configured.to_vec()
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins.iter().collect::<Vec<_>>()
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_urls_must_be_http() {
        assert!(is_valid_source_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_valid_source_url("http://example.com/video"));
        assert!(!is_valid_source_url("ftp://example.com/video"));
        assert!(!is_valid_source_url("file:///etc/passwd"));
        assert!(!is_valid_source_url("not a url"));
    }

    #[test]
    fn origins_are_normalized() {
        assert_eq!(
            normalize_origin("HTTPS://Example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/path"), None);
        assert_eq!(normalize_origin("ws://example.com"), None);
    }

    #[test]
    fn invalid_configured_origin_is_rejected() {
        assert!(build_cors_layer(&["https://ok.example".to_string()]).is_ok());
        assert!(build_cors_layer(&["nonsense".to_string()]).is_err());
    }
}
