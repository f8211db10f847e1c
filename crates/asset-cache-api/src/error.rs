//! API error types

use asset_cache_core::CoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Unauthorized".to_string(),
            ),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", "Forbidden".to_string()),
            ApiError::Core(e) => match e {
                CoreError::Fetch(_) => (
                    StatusCode::BAD_GATEWAY,
                    "ORIGIN_UNAVAILABLE",
                    e.to_string(),
                ),
                CoreError::InstallFailed { .. } => (
                    StatusCode::BAD_GATEWAY,
                    "INSTALL_FAILED",
                    e.to_string(),
                ),
                CoreError::InvalidKey(msg) => {
                    (StatusCode::BAD_REQUEST, "INVALID_KEY", msg.clone())
                }
                CoreError::Storage(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    e.to_string(),
                ),
            },
        };

        let body = axum::Json(json!({
            "errors": [{
                "code": code,
                "message": message,
            }]
        }));

        (status, body).into_response()
    }
}
