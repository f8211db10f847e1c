//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] asset_cache_storage::StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] asset_cache_proxy::ProxyError),

    #[error("Install of {version} failed for: {}", describe(.failed))]
    InstallFailed {
        version: String,
        failed: Vec<InstallFailure>,
    },

    #[error("Invalid request key: {0}")]
    InvalidKey(String),
}

/// A base resource that could not be seeded during install
#[derive(Debug, Clone)]
pub struct InstallFailure {
    pub key: String,
    pub reason: String,
}

fn describe(failed: &[InstallFailure]) -> String {
    failed
        .iter()
        .map(|f| format!("{} ({})", f.key, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}
