//! Local disk storage backend

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{CacheStorage, Generation, compute_sha256, parse_digest};
use crate::entry::{CachedEntry, CachedResponse};
use crate::error::StorageError;

/// Longest label whose hex-encoded directory name fits a 255-byte file name
const MAX_NAME_LEN: usize = 127;

/// Local disk storage backend
///
/// Each generation is a directory named after the hex-encoded label:
/// `<base_path>/<hex(name)>/entries/<sha256(key)>.json` holds the entry
/// record and `<base_path>/<hex(name)>/blobs/<algorithm>/<first 2 chars>/<hash>`
/// holds the content-addressed body.
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage backend
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;

        info!("Initialized local cache storage at {:?}", base_path);

        Ok(Self { base_path })
    }

    fn generation_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.base_path.join(hex::encode(name.as_bytes())))
    }
}

#[async_trait]
impl CacheStorage for LocalStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Generation>, StorageError> {
        let path = self.generation_path(name)?;
        fs::create_dir_all(path.join("entries")).await?;
        fs::create_dir_all(path.join("blobs")).await?;

        Ok(Arc::new(LocalGeneration {
            name: name.to_string(),
            path,
        }))
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.generation_path(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.base_path).await?;

        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = item.file_name();
            let decoded = dir_name
                .to_str()
                .and_then(|s| hex::decode(s).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());

            match decoded {
                Some(name) => names.push(name),
                None => debug!("Ignoring foreign directory {:?}", item.path()),
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.generation_path(name)?;
        debug!("Deleting generation {} at {:?}", name, path);

        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// On-disk entry record; the body lives in the blob store
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    key: String,
    method: String,
    status: u16,
    headers: Vec<HeaderRecord>,
    body_digest: String,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HeaderRecord {
    name: String,
    value: Vec<u8>,
}

impl EntryRecord {
    fn from_entry(entry: &CachedEntry, body_digest: String) -> Self {
        let headers = entry
            .response
            .headers
            .iter()
            .map(|(name, value)| HeaderRecord {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();

        Self {
            key: entry.key.clone(),
            method: entry.method.as_str().to_string(),
            status: entry.response.status.as_u16(),
            headers,
            body_digest,
            stored_at: entry.stored_at,
        }
    }

    fn into_entry(self, body: Bytes) -> Result<CachedEntry, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt {
            key: self.key.clone(),
            reason,
        };

        let status = StatusCode::from_u16(self.status)
            .map_err(|e| corrupt(format!("status {}: {}", self.status, e)))?;
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| corrupt(format!("method {}: {}", self.method, e)))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for header in &self.headers {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| corrupt(format!("header name {}: {}", header.name, e)))?;
            let value = HeaderValue::from_bytes(&header.value)
                .map_err(|e| corrupt(format!("header {}: {}", header.name, e)))?;
            headers.append(name, value);
        }

        Ok(CachedEntry {
            key: self.key,
            method,
            response: CachedResponse::new(status, headers, body),
            stored_at: self.stored_at,
        })
    }
}

/// A generation stored on local disk
pub struct LocalGeneration {
    name: String,
    path: PathBuf,
}

impl LocalGeneration {
    fn record_path(&self, key: &str) -> PathBuf {
        let hash = compute_sha256(key.as_bytes());
        let hash = hash.trim_start_matches("sha256:");
        self.path.join("entries").join(format!("{}.json", hash))
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, StorageError> {
        let (algorithm, hash) = parse_digest(digest)?;

        // Use first 2 characters for sharding
        let shard = &hash[..2];
        Ok(self.path.join("blobs").join(algorithm).join(shard).join(hash))
    }

    /// Error for a write into a generation whose directory was deleted
    fn gone(&self) -> StorageError {
        StorageError::NotFound(self.name.clone())
    }

    /// Create a directory whose parent must already exist
    ///
    /// Never recreates the generation root, so a write racing a delete
    /// fails with `NotFound` instead of resurrecting the generation.
    async fn create_child_dir(&self, dir: &Path) -> Result<(), StorageError> {
        match fs::create_dir(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(self.gone()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Write a file atomically using a uniquely named temp file
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&temp_path, data).await {
            return Err(match e.kind() {
                ErrorKind::NotFound => self.gone(),
                _ => StorageError::Io(e),
            });
        }
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(match e.kind() {
                ErrorKind::NotFound => self.gone(),
                _ => StorageError::Io(e),
            });
        }
        Ok(())
    }

    /// Read an entry record, `None` if the key has no record
    async fn read_record(&self, path: &Path) -> Result<Option<EntryRecord>, StorageError> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl Generation for LocalGeneration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CachedEntry>, StorageError> {
        let record = match self.read_record(&self.record_path(key)).await? {
            Some(record) if record.key == key => record,
            _ => return Ok(None),
        };

        let blob_path = self.blob_path(&record.body_digest)?;
        let body = match fs::read(&blob_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Cache entry {} in {} has no body blob", key, self.name);
                return Ok(None);
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        record.into_entry(body).map(Some)
    }

    async fn put(&self, entry: CachedEntry) -> Result<(), StorageError> {
        let digest = compute_sha256(&entry.response.body);
        let blob_path = self.blob_path(&digest)?;

        debug!(
            "Storing {} in {} ({} bytes)",
            entry.key,
            self.name,
            entry.response.body.len()
        );

        if !fs::try_exists(&blob_path).await? {
            // blobs/<algorithm>/<shard>; `blobs` itself is created by open
            if let Some(shard_dir) = blob_path.parent() {
                if let Some(algorithm_dir) = shard_dir.parent() {
                    self.create_child_dir(algorithm_dir).await?;
                }
                self.create_child_dir(shard_dir).await?;
            }
            self.write_atomic(&blob_path, &entry.response.body).await?;
        }

        // The record rename is the commit point for the entry
        let record = EntryRecord::from_entry(&entry, digest);
        let data = serde_json::to_vec(&record)?;
        self.write_atomic(&self.record_path(&entry.key), &data).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.record_path(key);
        debug!("Deleting {} from {}", key, self.name);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut dir = match fs::read_dir(self.path.join("entries")).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(StorageError::Io(e)),
        };

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            // Records may vanish while listing
            match self.read_record(&path).await {
                Ok(Some(record)) => keys.push(record.key),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable record {:?}: {}", path, e),
            }
        }

        keys.sort();
        Ok(keys)
    }
}
