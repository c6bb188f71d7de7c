use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// The resolution stage could not produce metadata. No token exists.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("yt-dlp is not installed ({0}). Install yt-dlp or set YT_DLP_BIN.")]
    ToolMissing(String),

    #[error("metadata extraction timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),

    #[error("could not parse extractor output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

/// Why a redemption did not start streaming.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("download link not found")]
    TokenNotFound,

    #[error("download link has expired")]
    TokenExpired,

    #[error("unsupported format selector: {0}")]
    InvalidFormat(String),

    #[error("upstream stream failed: {0}")]
    Upstream(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self {
            code: Some("INVALID_URL"),
            ..Self::bad_request(message)
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(error: ResolveError) -> Self {
        let status = match error {
            ResolveError::Failed(_) | ResolveError::Timeout => StatusCode::BAD_REQUEST,
            ResolveError::ToolMissing(_) | ResolveError::InvalidOutput(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        Self {
            status,
            message: error.to_string(),
            code: Some("RESOLUTION_FAILED"),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        let (status, code) = match error {
            RelayError::TokenNotFound => (StatusCode::NOT_FOUND, "TOKEN_NOT_FOUND"),
            RelayError::TokenExpired => (StatusCode::GONE, "TOKEN_EXPIRED"),
            RelayError::InvalidFormat(_) => (StatusCode::BAD_REQUEST, "INVALID_FORMAT"),
            RelayError::Upstream(_) => (StatusCode::INTERNAL_SERVER_ERROR, "UPSTREAM_ERROR"),
        };

        Self {
            status,
            message: error.to_string(),
            code: Some(code),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
            code: Some("INVALID_REQUEST"),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self {
            code: Some("INVALID_REQUEST"),
            ..Self::bad_request(rejection.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}
