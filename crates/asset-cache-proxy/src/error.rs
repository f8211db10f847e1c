//! Proxy error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid origin URL: {0}")]
    InvalidUrl(String),

    #[error("Origin unreachable: {0}")]
    Unreachable(String),
}
