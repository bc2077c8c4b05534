//! API error type: adapters return rich errors, this layer maps them to
//! stable HTTP codes with a machine-readable `code` field.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::images::ImageError;
use crate::indexer::IndexError;
use crate::sessions::SessionError;
use crate::tokens::TokenError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(code: &'static str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, "authentication failed")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "code": self.code, "message": self.message }
        }));
        (self.status, body).into_response()
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        let code = match err {
            TokenError::InvalidFormat => "invalid_format",
            TokenError::InvalidToken => "invalid_token",
            TokenError::Expired => "expired",
            TokenError::Revoked => "revoked",
        };
        Self::unauthorized(code)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Conflict => {
                Self::new(StatusCode::CONFLICT, "conflict", err.to_string())
            }
            SessionError::NotRunning => Self::not_found(err.to_string()),
            SessionError::Spawn(e) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "subprocess_spawn_failed",
                e.to_string(),
            ),
        }
    }
}

impl From<IndexError> for ApiError {
    fn from(err: IndexError) -> Self {
        match &err {
            IndexError::PathTraversal(_) => Self::bad_request("path_traversal", err.to_string()),
            IndexError::SymlinkOutsideRepo(_) => {
                Self::bad_request("symlink_outside_repo", err.to_string())
            }
            IndexError::InvalidPath(_) => Self::bad_request("invalid_path", err.to_string()),
            IndexError::TooManyFiles(_) => Self::bad_request("too_many_files", err.to_string()),
            IndexError::IndexTooLarge(_) => Self::bad_request("index_too_large", err.to_string()),
            IndexError::ScanTimeout => Self::internal(err.to_string()),
            IndexError::Db(_) | IndexError::Io(_) | IndexError::Task(_) => {
                Self::internal(err.to_string())
            }
        }
    }
}

impl From<ImageError> for ApiError {
    fn from(err: ImageError) -> Self {
        match &err {
            ImageError::UnsupportedFormat => {
                Self::bad_request("unsupported_format", err.to_string())
            }
            ImageError::TooLarge { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, "too_large", err.to_string())
            }
            ImageError::StorageFull => {
                Self::new(StatusCode::INSUFFICIENT_STORAGE, "storage_full", err.to_string())
            }
            ImageError::NotFound => Self::not_found(err.to_string()),
            ImageError::InvalidPath(_) => Self::bad_request("invalid_path", err.to_string()),
            ImageError::Io(_) => Self::internal(err.to_string()),
        }
    }
}
