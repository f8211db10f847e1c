//! Cache storage traits

use async_trait::async_trait;
use std::sync::Arc;

use crate::entry::CachedEntry;
use crate::error::StorageError;

/// Storage holding named cache generations
///
/// A generation is created on first `open` and lives until `delete`.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a generation, creating it if absent
    async fn open(&self, name: &str) -> Result<Arc<dyn Generation>, StorageError>;

    /// Check if a generation exists
    async fn has(&self, name: &str) -> Result<bool, StorageError>;

    /// List all generation names
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Delete a generation and every entry in it
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;
}

/// A single cache generation
///
/// Every `put` and `delete` is atomic for its entry. There are no
/// cross-entry transactions.
#[async_trait]
pub trait Generation: Send + Sync {
    /// Name (version label) of this generation
    fn name(&self) -> &str;

    /// Look up an entry by exact request key
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>, StorageError>;

    /// Store an entry, replacing any entry with the same key
    async fn put(&self, entry: CachedEntry) -> Result<(), StorageError>;

    /// Delete an entry
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// List the request keys of all stored entries
    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Compute SHA256 digest of data
pub fn compute_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    format!("sha256:{}", hex::encode(result))
}

/// Parse a digest string (e.g., "sha256:abc123...")
pub fn parse_digest(digest: &str) -> Result<(&str, &str), StorageError> {
    match digest.split_once(':') {
        Some((algorithm, hash)) if !algorithm.is_empty() && hash.len() >= 2 => {
            Ok((algorithm, hash))
        }
        _ => Err(StorageError::Corrupt {
            key: digest.to_string(),
            reason: "invalid digest format".to_string(),
        }),
    }
}
