//! In-memory storage backend

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{CacheStorage, Generation};
use crate::entry::CachedEntry;
use crate::error::StorageError;

/// In-memory storage backend
///
/// Contents are lost when the process exits. Used for tests and for
/// deployments that do not need the cache to survive a restart.
#[derive(Default)]
pub struct MemoryStorage {
    generations: RwLock<BTreeMap<String, Arc<MemoryGeneration>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Generation>, StorageError> {
        if let Some(generation) = self.generations.read().get(name) {
            return Ok(generation.clone());
        }

        let mut generations = self.generations.write();
        let generation = generations
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Creating in-memory generation {}", name);
                Arc::new(MemoryGeneration::new(name))
            })
            .clone();
        Ok(generation)
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.generations.read().contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.generations.read().keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        debug!("Deleting in-memory generation {}", name);
        Ok(self.generations.write().remove(name).is_some())
    }
}

/// A generation held in memory
pub struct MemoryGeneration {
    name: String,
    entries: RwLock<BTreeMap<String, CachedEntry>>,
}

impl MemoryGeneration {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl Generation for MemoryGeneration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<CachedEntry>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, entry: CachedEntry) -> Result<(), StorageError> {
        self.entries.write().insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}
