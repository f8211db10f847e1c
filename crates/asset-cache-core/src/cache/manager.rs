//! Asset cache manager implementation

use asset_cache_proxy::Fetcher;
use asset_cache_storage::{
    CacheStorage, CachedEntry, CachedRequest, CachedResponse, Generation, StorageError,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use http::Method;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock as AsyncRwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::lifecycle::{GenerationInfo, GenerationState};
use crate::error::{CoreError, InstallFailure};
use crate::key::{VersionedKey, normalize_key};

/// Cache counters since startup
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub bypass_count: u64,
    pub stored_count: u64,
    pub evicted_count: u64,
}

/// Where a handled response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Served from the current generation
    Cache,
    /// Fetched from the network after a cache miss
    Network,
    /// Forwarded without caching: no generation is current, the method is
    /// not cacheable, or a HEAD request missed
    Bypass,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Cache => "hit",
            ResponseSource::Network => "miss",
            ResponseSource::Bypass => "bypass",
        }
    }
}

/// Response to a handled request
#[derive(Debug, Clone)]
pub struct Handled {
    pub response: CachedResponse,
    pub source: ResponseSource,
}

/// Outcome of a successful install
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub version: String,
    pub stored: usize,
    /// False when an activation of another label won while installing
    pub current: bool,
}

/// Cache-first manager over versioned cache generations
///
/// Serves GET requests from the current generation, falling back to the
/// network and storing every 200 response. A fresh schema revision
/// evicts older revisions of the same document in the background.
pub struct AssetCacheManager {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    current: RwLock<Option<Arc<dyn Generation>>>,
    states: RwLock<HashMap<String, GenerationState>>,
    stats: Arc<AsyncRwLock<CacheStats>>,
    background: TaskTracker,
    /// Bumped by every activate; install only promotes if it is unchanged
    activations: AtomicU64,
}

impl AssetCacheManager {
    /// Create a new manager; no generation is current until install or activate
    pub fn new(storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        info!("Initializing asset cache manager");

        Self {
            storage,
            fetcher,
            current: RwLock::new(None),
            states: RwLock::new(HashMap::new()),
            stats: Arc::new(AsyncRwLock::new(CacheStats::default())),
            background: TaskTracker::new(),
            activations: AtomicU64::new(0),
        }
    }

    /// Label of the generation currently serving traffic
    pub fn current_version(&self) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .map(|generation| generation.name().to_string())
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Seed a generation with the base resources and make it current
    ///
    /// Entries that were fetched stay stored when another resource fails;
    /// the generation then only becomes current through `activate`.
    ///
    /// An `activate` that starts while this install runs wins: unless it
    /// activated this same label, the installed generation is deleted
    /// instead of promoted.
    pub async fn install(
        &self,
        version: &str,
        resources: &[String],
    ) -> Result<InstallReport, CoreError> {
        let mut keys: Vec<String> = Vec::with_capacity(resources.len());
        for resource in resources {
            let key = normalize_key(resource)?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        info!(
            "Installing generation {} ({} base resources)",
            version,
            keys.len()
        );

        let epoch = self.activations.load(Ordering::SeqCst);
        let previous = self.set_state(version, GenerationState::Installing);
        let generation = match self.storage.open(version).await {
            Ok(generation) => generation,
            Err(e) => {
                self.restore_state(version, previous);
                return Err(e.into());
            }
        };

        let results =
            join_all(keys.iter().map(|key| self.seed(generation.as_ref(), key))).await;
        let failed: Vec<InstallFailure> =
            results.into_iter().filter_map(Result::err).collect();

        if !failed.is_empty() {
            warn!(
                "Install of {} incomplete: {} of {} base resources failed",
                version,
                failed.len(),
                keys.len()
            );
            self.restore_state(version, previous);
            return Err(CoreError::InstallFailed {
                version: version.to_string(),
                failed,
            });
        }

        let current = if self.promote(generation, Some(epoch)) {
            true
        } else if self.current_version().as_deref() == Some(version) {
            self.set_state(version, GenerationState::Current);
            true
        } else {
            info!(
                "Generation {} was superseded by an activation while installing, discarding",
                version
            );
            self.states.write().remove(version);
            if let Err(e) = self.storage.delete(version).await {
                warn!("Failed to delete superseded generation {}: {}", version, e);
            }
            false
        };

        if current {
            info!("Installed generation {} ({} entries)", version, keys.len());
        }

        Ok(InstallReport {
            version: version.to_string(),
            stored: keys.len(),
            current,
        })
    }

    /// Make `version` current and delete every other generation
    ///
    /// Returns the labels that were deleted. Generations still installing
    /// are left alone; failed deletions are logged and skipped.
    pub async fn activate(&self, version: &str) -> Result<Vec<String>, CoreError> {
        info!("Activating generation {}", version);
        self.activations.fetch_add(1, Ordering::SeqCst);

        if self.current_version().as_deref() != Some(version) {
            let generation = self.storage.open(version).await?;
            self.promote(generation, None);
        }

        let names = self.storage.keys().await?;
        let mut stale = Vec::new();
        {
            let mut states = self.states.write();
            for name in names {
                if name == version {
                    continue;
                }
                if states.get(&name) == Some(&GenerationState::Installing) {
                    debug!("Keeping generation {} while it installs", name);
                    continue;
                }
                states.insert(name.clone(), GenerationState::Stale);
                stale.push(name);
            }
        }

        let results = join_all(stale.iter().map(|name| self.storage.delete(name))).await;

        let mut deleted = Vec::new();
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(existed) => {
                    self.states.write().remove(&name);
                    if existed {
                        debug!("Deleted stale generation {}", name);
                        deleted.push(name);
                    }
                }
                Err(e) => warn!("Failed to delete generation {}: {}", name, e),
            }
        }

        info!(
            "Activated generation {} ({} stale generations deleted)",
            version,
            deleted.len()
        );
        Ok(deleted)
    }

    /// Answer a request cache-first
    ///
    /// Only GET responses are stored. HEAD is answered from a cached GET
    /// when one exists; every other method goes straight to the network.
    /// Non-200 responses are returned without being stored. Network
    /// failures surface as `CoreError::Fetch`.
    pub async fn handle(&self, request: &CachedRequest) -> Result<Handled, CoreError> {
        let current = self.current.read().clone();
        let Some(generation) = current else {
            debug!("No current generation, forwarding {}", request.key);
            return self.forward(request).await;
        };

        let is_head = request.method == Method::HEAD;
        if request.method != Method::GET && !is_head {
            debug!("Forwarding {} {} without caching", request.method, request.key);
            return self.forward(request).await;
        }

        match generation.get(&request.key).await {
            Ok(Some(mut entry)) => {
                debug!("Cache hit for {} in {}", request.key, generation.name());
                self.record_hit().await;
                if is_head {
                    entry.response.body.clear();
                }
                return Ok(Handled {
                    response: entry.response,
                    source: ResponseSource::Cache,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(
                "Cache lookup failed for {}, falling back to network: {}",
                request.key, e
            ),
        }

        if is_head {
            debug!("HEAD miss for {}, forwarding", request.key);
            return self.forward(request).await;
        }

        debug!("Cache miss for {}, fetching from network", request.key);
        self.record_miss().await;

        let response = self.fetcher.fetch(request).await?;
        if !response.is_cacheable() {
            debug!(
                "Not caching {} (status {})",
                request.key, response.status
            );
            return Ok(Handled {
                response,
                source: ResponseSource::Network,
            });
        }

        if let Some(fresh) = VersionedKey::parse(&request.key) {
            self.spawn_revision_eviction(
                generation.clone(),
                fresh,
                request.key.clone(),
                Utc::now(),
            );
        }

        match generation
            .put(CachedEntry::new(request, response.clone()))
            .await
        {
            Ok(()) => self.record_stored().await,
            Err(e) => warn!("Failed to cache {}: {}", request.key, e),
        }

        Ok(Handled {
            response,
            source: ResponseSource::Network,
        })
    }

    /// List every stored generation with its lifecycle state
    ///
    /// Generations found in storage without a known state (left over
    /// from a previous run) are reported as stale.
    pub async fn generations(&self) -> Result<Vec<GenerationInfo>, CoreError> {
        let names = self.storage.keys().await?;
        let mut infos = Vec::with_capacity(names.len());

        for name in names {
            let state = self
                .states
                .read()
                .get(&name)
                .copied()
                .unwrap_or(GenerationState::Stale);
            let entries = self.storage.open(&name).await?.keys().await?.len();
            infos.push(GenerationInfo {
                name,
                state,
                entries,
            });
        }

        Ok(infos)
    }

    /// Wait for outstanding background evictions to finish
    pub async fn settle(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Fetch from the network without touching the cache
    async fn forward(&self, request: &CachedRequest) -> Result<Handled, CoreError> {
        self.record_bypass().await;
        let response = self.fetcher.fetch(request).await?;
        Ok(Handled {
            response,
            source: ResponseSource::Bypass,
        })
    }

    /// Fetch and store one base resource
    async fn seed(&self, generation: &dyn Generation, key: &str) -> Result<(), InstallFailure> {
        let failure = |reason: String| InstallFailure {
            key: key.to_string(),
            reason,
        };

        let request = CachedRequest::get(key);
        let response = self
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| failure(e.to_string()))?;

        if !response.is_cacheable() {
            return Err(failure(format!("status {}", response.status)));
        }

        generation
            .put(CachedEntry::new(&request, response))
            .await
            .map_err(|e| failure(e.to_string()))?;

        debug!("Seeded {} into {}", key, generation.name());
        Ok(())
    }

    /// Make a generation current, marking the one it replaces as stale
    ///
    /// With `epoch`, nothing changes and `false` is returned if an
    /// activation started after the epoch was read.
    fn promote(&self, generation: Arc<dyn Generation>, epoch: Option<u64>) -> bool {
        let name = generation.name().to_string();
        let mut states = self.states.write();
        if let Some(epoch) = epoch
            && self.activations.load(Ordering::SeqCst) != epoch
        {
            return false;
        }
        let mut current = self.current.write();

        if let Some(previous) = current.as_ref()
            && previous.name() != name
        {
            info!("Generation {} superseded by {}", previous.name(), name);
            states.insert(previous.name().to_string(), GenerationState::Stale);
        }

        states.insert(name, GenerationState::Current);
        *current = Some(generation);
        true
    }

    fn set_state(&self, version: &str, state: GenerationState) -> Option<GenerationState> {
        self.states.write().insert(version.to_string(), state)
    }

    fn restore_state(&self, version: &str, previous: Option<GenerationState>) {
        let mut states = self.states.write();
        match previous {
            Some(state) => {
                states.insert(version.to_string(), state);
            }
            None => {
                states.remove(version);
            }
        }
    }

    fn spawn_revision_eviction(
        &self,
        generation: Arc<dyn Generation>,
        fresh: VersionedKey,
        fresh_key: String,
        cutoff: DateTime<Utc>,
    ) {
        let stats = self.stats.clone();

        self.background.spawn(async move {
            match evict_revisions(generation.as_ref(), &fresh, &fresh_key, cutoff).await {
                Ok(0) => {}
                Ok(evicted) => {
                    debug!(
                        "Evicted {} superseded revisions of module {}",
                        evicted,
                        fresh.module_id()
                    );
                    metrics::counter!("asset_cache_evicted_total").increment(evicted);
                    stats.write().await.evicted_count += evicted;
                }
                Err(e) => warn!(
                    "Revision eviction scan failed for module {}: {}",
                    fresh.module_id(),
                    e
                ),
            }
        });
    }

    async fn record_hit(&self) {
        metrics::counter!("asset_cache_hits_total").increment(1);
        self.stats.write().await.hit_count += 1;
    }

    async fn record_miss(&self) {
        metrics::counter!("asset_cache_misses_total").increment(1);
        self.stats.write().await.miss_count += 1;
    }

    async fn record_bypass(&self) {
        metrics::counter!("asset_cache_bypassed_total").increment(1);
        self.stats.write().await.bypass_count += 1;
    }

    async fn record_stored(&self) {
        metrics::counter!("asset_cache_stored_total").increment(1);
        self.stats.write().await.stored_count += 1;
    }
}

/// Delete the revisions of the document `fresh` names that were stored before `cutoff`
///
/// `fresh_key` itself is never touched, so the entry being stored survives
/// whether this sweep runs before or after the store. Revisions stored after
/// `cutoff` by concurrent requests are newer than `fresh` and are kept.
async fn evict_revisions(
    generation: &dyn Generation,
    fresh: &VersionedKey,
    fresh_key: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, StorageError> {
    let mut evicted = 0;

    for key in generation.keys().await? {
        if key == fresh_key {
            continue;
        }
        let Some(candidate) = VersionedKey::parse(&key) else {
            continue;
        };
        if !candidate.same_resource(fresh) {
            continue;
        }
        match generation.get(&key).await {
            Ok(Some(entry)) if entry.stored_at < cutoff => {}
            Ok(_) => continue,
            Err(e) => {
                warn!("Failed to read {} during eviction: {}", key, e);
                continue;
            }
        }

        match generation.delete(&key).await {
            Ok(true) => {
                debug!("Evicted superseded revision {}", key);
                evicted += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to evict {}: {}", key, e),
        }
    }

    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asset_cache_proxy::ProxyError;
    use asset_cache_storage::MemoryStorage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, StatusCode, header};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    const MODULE: &str = "36954b7c-807f-4a29-988c-f3945172da71";

    /// Fetcher answering from a fixed table and counting calls per key
    #[derive(Default)]
    struct ScriptedFetcher {
        responses: Mutex<HashMap<String, CachedResponse>>,
        calls: Mutex<HashMap<String, usize>>,
        offline: AtomicBool,
    }

    impl ScriptedFetcher {
        fn serve(&self, key: &str, status: StatusCode, body: &'static str) {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            self.responses
                .lock()
                .insert(key.to_string(), CachedResponse::new(status, headers, body));
        }

        fn calls(&self, key: &str) -> usize {
            self.calls.lock().get(key).copied().unwrap_or(0)
        }

        fn go_offline(&self) {
            self.offline.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: &CachedRequest) -> Result<CachedResponse, ProxyError> {
            *self.calls.lock().entry(request.key.clone()).or_default() += 1;

            if self.offline.load(Ordering::SeqCst) {
                return Err(ProxyError::Unreachable(request.key.clone()));
            }

            Ok(self
                .responses
                .lock()
                .get(&request.key)
                .cloned()
                .unwrap_or_else(|| {
                    CachedResponse::new(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new())
                }))
        }
    }

    fn setup() -> (Arc<MemoryStorage>, Arc<ScriptedFetcher>, AssetCacheManager) {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let manager = AssetCacheManager::new(storage.clone(), fetcher.clone());
        (storage, fetcher, manager)
    }

    fn schema_key(module: &str, date: u64) -> String {
        format!("/app/schema.json?module_id={}&date={}", module, date)
    }

    async fn stored_keys(storage: &MemoryStorage, version: &str) -> Vec<String> {
        storage.open(version).await.unwrap().keys().await.unwrap()
    }

    #[tokio::test]
    async fn test_miss_fetches_once_and_stores() {
        let (storage, fetcher, manager) = setup();
        fetcher.serve("/app.js", StatusCode::OK, "console.log(1)");
        manager.install("v1", &[]).await.unwrap();

        let first = manager.handle(&CachedRequest::get("/app.js")).await.unwrap();
        assert_eq!(first.source, ResponseSource::Network);
        assert_eq!(fetcher.calls("/app.js"), 1);
        assert_eq!(stored_keys(&storage, "v1").await, vec!["/app.js".to_string()]);

        let second = manager.handle(&CachedRequest::get("/app.js")).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(fetcher.calls("/app.js"), 1);

        let stats = manager.stats().await;
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.stored_count, 1);
    }

    #[tokio::test]
    async fn test_cached_response_is_byte_identical() {
        let (_storage, fetcher, manager) = setup();
        fetcher.serve("/data.bin", StatusCode::OK, "\u{0}\u{1}payload");
        manager.install("v1", &[]).await.unwrap();

        let fetched = manager.handle(&CachedRequest::get("/data.bin")).await.unwrap();
        let cached = manager.handle(&CachedRequest::get("/data.bin")).await.unwrap();

        assert_eq!(cached.source, ResponseSource::Cache);
        assert_eq!(cached.response, fetched.response);
        assert_eq!(
            cached.response.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
    }

    #[tokio::test]
    async fn test_non_200_is_not_stored() {
        let (storage, fetcher, manager) = setup();
        fetcher.serve("/partial", StatusCode::PARTIAL_CONTENT, "part");
        fetcher.serve("/broken", StatusCode::INTERNAL_SERVER_ERROR, "oops");
        manager.install("v1", &[]).await.unwrap();

        let partial = manager.handle(&CachedRequest::get("/partial")).await.unwrap();
        assert_eq!(partial.response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(partial.response.body, "part");

        let missing = manager.handle(&CachedRequest::get("/missing")).await.unwrap();
        assert_eq!(missing.response.status, StatusCode::NOT_FOUND);

        manager.handle(&CachedRequest::get("/broken")).await.unwrap();
        manager.handle(&CachedRequest::get("/broken")).await.unwrap();
        assert_eq!(fetcher.calls("/broken"), 2);

        assert!(stored_keys(&storage, "v1").await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates_without_caching() {
        let (storage, fetcher, manager) = setup();
        manager.install("v1", &[]).await.unwrap();
        fetcher.go_offline();

        let result = manager.handle(&CachedRequest::get("/index.html")).await;
        assert!(matches!(result, Err(CoreError::Fetch(ProxyError::Unreachable(_)))));
        assert!(stored_keys(&storage, "v1").await.is_empty());
    }

    #[tokio::test]
    async fn test_install_then_offline_serves_seeded_entry() {
        let (_storage, fetcher, manager) = setup();
        fetcher.serve("/", StatusCode::OK, "shell");
        fetcher.serve("/index.html", StatusCode::OK, "<html></html>");

        let report = manager
            .install("build-42", &["/".to_string(), "/index.html".to_string()])
            .await
            .unwrap();
        assert_eq!(report.stored, 2);
        assert_eq!(manager.current_version().as_deref(), Some("build-42"));

        fetcher.go_offline();
        let handled = manager.handle(&CachedRequest::get("/")).await.unwrap();
        assert_eq!(handled.source, ResponseSource::Cache);
        assert_eq!(handled.response.body, "shell");
        assert_eq!(fetcher.calls("/"), 1);
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let (storage, fetcher, manager) = setup();
        fetcher.serve("/", StatusCode::OK, "shell");
        fetcher.serve("/manifest.json", StatusCode::OK, "{}");
        let resources = vec![
            "/".to_string(),
            "manifest.json".to_string(),
            "/manifest.json".to_string(),
        ];

        manager.install("v1", &resources).await.unwrap();
        manager.install("v1", &resources).await.unwrap();

        assert_eq!(
            stored_keys(&storage, "v1").await,
            vec!["/".to_string(), "/manifest.json".to_string()]
        );
        assert_eq!(fetcher.calls("/manifest.json"), 2);
    }

    #[tokio::test]
    async fn test_install_failure_keeps_partial_entries() {
        let (storage, fetcher, manager) = setup();
        fetcher.serve("/", StatusCode::OK, "shell");

        let result = manager
            .install("v2", &["/".to_string(), "/styles_v2.css".to_string()])
            .await;

        match result {
            Err(CoreError::InstallFailed { version, failed }) => {
                assert_eq!(version, "v2");
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].key, "/styles_v2.css");
            }
            other => panic!("expected install failure, got {:?}", other),
        }

        assert_eq!(stored_keys(&storage, "v2").await, vec!["/".to_string()]);
        assert_eq!(manager.current_version(), None);
    }

    #[tokio::test]
    async fn test_failed_reinstall_keeps_current() {
        let (_storage, fetcher, manager) = setup();
        fetcher.serve("/", StatusCode::OK, "shell");
        manager.install("v1", &["/".to_string()]).await.unwrap();

        fetcher.go_offline();
        assert!(manager.install("v1", &["/".to_string()]).await.is_err());

        assert_eq!(manager.current_version().as_deref(), Some("v1"));
        let generations = manager.generations().await.unwrap();
        assert_eq!(generations[0].state, GenerationState::Current);
    }

    #[tokio::test]
    async fn test_install_rejects_invalid_resource() {
        let (storage, _fetcher, manager) = setup();

        let result = manager.install("v1", &["/bad path".to_string()]).await;
        assert!(matches!(result, Err(CoreError::InvalidKey(_))));
        assert!(!storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_newer_schema_revision_evicts_older() {
        let (storage, fetcher, manager) = setup();
        let old_key = schema_key(MODULE, 100);
        let new_key = schema_key(MODULE, 200);
        fetcher.serve(&old_key, StatusCode::OK, "{\"rev\":100}");
        fetcher.serve(&new_key, StatusCode::OK, "{\"rev\":200}");
        manager.install("v1", &[]).await.unwrap();

        manager.handle(&CachedRequest::get(old_key.clone())).await.unwrap();
        manager.handle(&CachedRequest::get(new_key.clone())).await.unwrap();
        manager.settle().await;

        assert_eq!(stored_keys(&storage, "v1").await, vec![new_key.clone()]);
        assert_eq!(manager.stats().await.evicted_count, 1);

        let newest = manager.handle(&CachedRequest::get(new_key.clone())).await.unwrap();
        assert_eq!(newest.source, ResponseSource::Cache);
        assert_eq!(fetcher.calls(&new_key), 1);

        let older = manager.handle(&CachedRequest::get(old_key.clone())).await.unwrap();
        assert_eq!(older.source, ResponseSource::Network);
        assert_eq!(fetcher.calls(&old_key), 2);
    }

    #[tokio::test]
    async fn test_eviction_is_scoped_to_module_and_path() {
        let (storage, fetcher, manager) = setup();
        let other_module = "11111111-2222-4333-8444-555555555555";
        let keys = [
            schema_key(MODULE, 100),
            schema_key(other_module, 100),
            format!("/other/schema.json?module_id={}&date=100", MODULE),
            "/index.html".to_string(),
        ];
        manager.install("v1", &[]).await.unwrap();
        for key in &keys {
            fetcher.serve(key, StatusCode::OK, "{}");
            manager.handle(&CachedRequest::get(key.clone())).await.unwrap();
        }

        let fresh = schema_key(MODULE, 200);
        fetcher.serve(&fresh, StatusCode::OK, "{}");
        manager.handle(&CachedRequest::get(fresh.clone())).await.unwrap();
        manager.settle().await;

        let remaining = stored_keys(&storage, "v1").await;
        assert!(!remaining.contains(&keys[0]));
        assert!(remaining.contains(&keys[1]));
        assert!(remaining.contains(&keys[2]));
        assert!(remaining.contains(&keys[3]));
        assert!(remaining.contains(&fresh));
    }

    #[tokio::test]
    async fn test_failed_schema_fetch_does_not_evict() {
        let (storage, fetcher, manager) = setup();
        let old_key = schema_key(MODULE, 100);
        let broken_key = schema_key(MODULE, 300);
        fetcher.serve(&old_key, StatusCode::OK, "{}");
        fetcher.serve(&broken_key, StatusCode::INTERNAL_SERVER_ERROR, "");
        manager.install("v1", &[]).await.unwrap();

        manager.handle(&CachedRequest::get(old_key.clone())).await.unwrap();
        manager.handle(&CachedRequest::get(broken_key)).await.unwrap();
        manager.settle().await;

        assert_eq!(stored_keys(&storage, "v1").await, vec![old_key]);
    }

    #[tokio::test]
    async fn test_eviction_keeps_fresh_key_in_either_order() {
        let storage = MemoryStorage::new();
        let generation = storage.open("v1").await.unwrap();
        let old_key = schema_key(MODULE, 100);
        let new_key = schema_key(MODULE, 200);
        let fresh = VersionedKey::parse(&new_key).unwrap();
        let response = CachedResponse::new(StatusCode::OK, HeaderMap::new(), "{}");
        let put = |key: &String| {
            CachedEntry::new(&CachedRequest::get(key.clone()), response.clone())
        };

        // Store first, then sweep
        generation.put(put(&old_key)).await.unwrap();
        generation.put(put(&new_key)).await.unwrap();
        let evicted = evict_revisions(generation.as_ref(), &fresh, &new_key, Utc::now())
            .await
            .unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(generation.keys().await.unwrap(), vec![new_key.clone()]);

        // Sweep first, then store
        generation.delete(&new_key).await.unwrap();
        generation.put(put(&old_key)).await.unwrap();
        let evicted = evict_revisions(generation.as_ref(), &fresh, &new_key, Utc::now())
            .await
            .unwrap();
        assert_eq!(evicted, 1);
        generation.put(put(&new_key)).await.unwrap();
        assert_eq!(generation.keys().await.unwrap(), vec![new_key]);
    }

    #[tokio::test]
    async fn test_late_sweep_keeps_newer_revision() {
        let storage = MemoryStorage::new();
        let generation = storage.open("v1").await.unwrap();
        let old_key = schema_key(MODULE, 100);
        let new_key = schema_key(MODULE, 200);
        let response = CachedResponse::new(StatusCode::OK, HeaderMap::new(), "{}");

        // The sweep for the older revision was scheduled before the newer one landed
        let cutoff = Utc::now();
        generation
            .put(CachedEntry::new(&CachedRequest::get(new_key.clone()), response))
            .await
            .unwrap();

        let stale = VersionedKey::parse(&old_key).unwrap();
        let evicted = evict_revisions(generation.as_ref(), &stale, &old_key, cutoff)
            .await
            .unwrap();
        assert_eq!(evicted, 0);
        assert_eq!(generation.keys().await.unwrap(), vec![new_key]);
    }

    #[tokio::test]
    async fn test_activate_deletes_other_generations() {
        let (storage, _fetcher, manager) = setup();
        manager.install("v1", &[]).await.unwrap();
        manager.install("v2", &[]).await.unwrap();

        let states: Vec<_> = manager
            .generations()
            .await
            .unwrap()
            .into_iter()
            .map(|info| (info.name, info.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("v1".to_string(), GenerationState::Stale),
                ("v2".to_string(), GenerationState::Current),
            ]
        );

        let deleted = manager.activate("v2").await.unwrap();
        assert_eq!(deleted, vec!["v1".to_string()]);
        assert_eq!(storage.keys().await.unwrap(), vec!["v2".to_string()]);
        assert_eq!(manager.current_version().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_activate_takes_over_uninstalled_label() {
        let (storage, fetcher, manager) = setup();
        fetcher.serve("/", StatusCode::OK, "shell");
        manager.install("v1", &["/".to_string()]).await.unwrap();

        manager.activate("v2").await.unwrap();

        assert_eq!(manager.current_version().as_deref(), Some("v2"));
        assert_eq!(storage.keys().await.unwrap(), vec!["v2".to_string()]);

        let handled = manager.handle(&CachedRequest::get("/")).await.unwrap();
        assert_eq!(handled.source, ResponseSource::Network);
        assert_eq!(stored_keys(&storage, "v2").await, vec!["/".to_string()]);
    }

    #[tokio::test]
    async fn test_no_current_generation_bypasses_cache() {
        let (storage, fetcher, manager) = setup();
        fetcher.serve("/", StatusCode::OK, "shell");

        let handled = manager.handle(&CachedRequest::get("/")).await.unwrap();
        assert_eq!(handled.source, ResponseSource::Bypass);
        assert_eq!(handled.response.body, "shell");
        assert!(storage.keys().await.unwrap().is_empty());
        assert_eq!(manager.stats().await.bypass_count, 1);
    }

    #[tokio::test]
    async fn test_head_served_from_cached_get() {
        let (_storage, fetcher, manager) = setup();
        fetcher.serve("/", StatusCode::OK, "shell");
        manager.install("v1", &["/".to_string()]).await.unwrap();

        let mut head = CachedRequest::get("/");
        head.method = Method::HEAD;
        let handled = manager.handle(&head).await.unwrap();

        assert_eq!(handled.source, ResponseSource::Cache);
        assert_eq!(handled.response.status, StatusCode::OK);
        assert!(handled.response.body.is_empty());
        assert_eq!(fetcher.calls("/"), 1);

        // The stored GET body is untouched
        let get = manager.handle(&CachedRequest::get("/")).await.unwrap();
        assert_eq!(get.response.body, "shell");
    }

    #[tokio::test]
    async fn test_head_miss_does_not_store() {
        let (storage, fetcher, manager) = setup();
        manager.install("v1", &[]).await.unwrap();
        fetcher.serve("/app.js", StatusCode::OK, "full body");

        let mut head = CachedRequest::get("/app.js");
        head.method = Method::HEAD;
        let handled = manager.handle(&head).await.unwrap();
        assert_eq!(handled.source, ResponseSource::Bypass);
        assert!(stored_keys(&storage, "v1").await.is_empty());

        let first = manager.handle(&CachedRequest::get("/app.js")).await.unwrap();
        assert_eq!(first.source, ResponseSource::Network);
        assert_eq!(first.response.body, "full body");

        let second = manager.handle(&CachedRequest::get("/app.js")).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.response.body, "full body");
    }

    #[tokio::test]
    async fn test_non_get_requests_always_reach_network() {
        let (storage, fetcher, manager) = setup();
        manager.install("v1", &[]).await.unwrap();
        fetcher.serve("/api/save", StatusCode::OK, "saved");

        for body in ["first", "second"] {
            let mut post = CachedRequest::get("/api/save");
            post.method = Method::POST;
            post.body = Bytes::from_static(body.as_bytes());

            let handled = manager.handle(&post).await.unwrap();
            assert_eq!(handled.source, ResponseSource::Bypass);
        }

        assert_eq!(fetcher.calls("/api/save"), 2);
        assert!(stored_keys(&storage, "v1").await.is_empty());

        // A POST never answers a later GET either
        let get = manager.handle(&CachedRequest::get("/api/save")).await.unwrap();
        assert_eq!(get.source, ResponseSource::Network);
    }

    /// Storage over `MemoryStorage` whose failures can be switched on
    #[derive(Default)]
    struct FailingStorage {
        inner: MemoryStorage,
        fail_delete: Mutex<Vec<String>>,
        fail_put: Arc<AtomicBool>,
        fail_keys: Arc<AtomicBool>,
    }

    struct FailingGeneration {
        inner: Arc<dyn Generation>,
        fail_put: Arc<AtomicBool>,
        fail_keys: Arc<AtomicBool>,
    }

    fn disk_error() -> StorageError {
        StorageError::Io(std::io::Error::other("disk unavailable"))
    }

    #[async_trait]
    impl CacheStorage for FailingStorage {
        async fn open(&self, name: &str) -> Result<Arc<dyn Generation>, StorageError> {
            Ok(Arc::new(FailingGeneration {
                inner: self.inner.open(name).await?,
                fail_put: self.fail_put.clone(),
                fail_keys: self.fail_keys.clone(),
            }))
        }

        async fn has(&self, name: &str) -> Result<bool, StorageError> {
            self.inner.has(name).await
        }

        async fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.inner.keys().await
        }

        async fn delete(&self, name: &str) -> Result<bool, StorageError> {
            if self.fail_delete.lock().iter().any(|n| n == name) {
                return Err(disk_error());
            }
            self.inner.delete(name).await
        }
    }

    #[async_trait]
    impl Generation for FailingGeneration {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, key: &str) -> Result<Option<CachedEntry>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, entry: CachedEntry) -> Result<(), StorageError> {
            if self.fail_put.load(Ordering::SeqCst) {
                return Err(disk_error());
            }
            self.inner.put(entry).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key).await
        }

        async fn keys(&self) -> Result<Vec<String>, StorageError> {
            if self.fail_keys.load(Ordering::SeqCst) {
                return Err(disk_error());
            }
            self.inner.keys().await
        }
    }

    fn setup_failing() -> (Arc<FailingStorage>, Arc<ScriptedFetcher>, AssetCacheManager) {
        let storage = Arc::new(FailingStorage::default());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let manager = AssetCacheManager::new(storage.clone(), fetcher.clone());
        (storage, fetcher, manager)
    }

    #[tokio::test]
    async fn test_activate_tolerates_failed_delete() {
        let (storage, _fetcher, manager) = setup_failing();
        for version in ["v1", "v2", "v3"] {
            manager.install(version, &[]).await.unwrap();
        }
        storage.fail_delete.lock().push("v1".to_string());

        let deleted = manager.activate("v3").await.unwrap();

        assert_eq!(deleted, vec!["v2".to_string()]);
        assert_eq!(manager.current_version().as_deref(), Some("v3"));
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["v1".to_string(), "v3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_store_failure_still_returns_response() {
        let (storage, fetcher, manager) = setup_failing();
        fetcher.serve("/app.js", StatusCode::OK, "console.log(1)");
        manager.install("v1", &[]).await.unwrap();
        storage.fail_put.store(true, Ordering::SeqCst);

        let handled = manager.handle(&CachedRequest::get("/app.js")).await.unwrap();
        assert_eq!(handled.source, ResponseSource::Network);
        assert_eq!(handled.response.body, "console.log(1)");
        assert_eq!(manager.stats().await.stored_count, 0);

        // Nothing was stored, so the next request goes to the network again
        manager.handle(&CachedRequest::get("/app.js")).await.unwrap();
        assert_eq!(fetcher.calls("/app.js"), 2);
    }

    #[tokio::test]
    async fn test_eviction_scan_failure_is_swallowed() {
        let (storage, fetcher, manager) = setup_failing();
        let old_key = schema_key(MODULE, 100);
        let new_key = schema_key(MODULE, 200);
        fetcher.serve(&old_key, StatusCode::OK, "{\"rev\":100}");
        fetcher.serve(&new_key, StatusCode::OK, "{\"rev\":200}");
        manager.install("v1", &[]).await.unwrap();
        manager.handle(&CachedRequest::get(old_key.clone())).await.unwrap();

        storage.fail_keys.store(true, Ordering::SeqCst);
        let handled = manager.handle(&CachedRequest::get(new_key.clone())).await.unwrap();
        assert_eq!(handled.source, ResponseSource::Network);
        manager.settle().await;
        storage.fail_keys.store(false, Ordering::SeqCst);

        assert_eq!(manager.stats().await.evicted_count, 0);
        assert_eq!(
            storage.inner.open("v1").await.unwrap().keys().await.unwrap(),
            vec![old_key, new_key]
        );
    }

    /// Fetcher holding every response until released
    #[derive(Default)]
    struct GatedFetcher {
        release: Notify,
    }

    #[async_trait]
    impl Fetcher for GatedFetcher {
        async fn fetch(&self, _request: &CachedRequest) -> Result<CachedResponse, ProxyError> {
            self.release.notified().await;
            Ok(CachedResponse::new(StatusCode::OK, HeaderMap::new(), "shell"))
        }
    }

    #[tokio::test]
    async fn test_activation_during_install_wins() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(GatedFetcher::default());
        let manager = AssetCacheManager::new(storage.clone(), fetcher.clone());

        let urls = ["/".to_string()];
        let (report, deleted) = tokio::join!(
            manager.install("v1", &urls),
            async {
                let deleted = manager.activate("v2").await;
                fetcher.release.notify_one();
                deleted
            }
        );

        let report = report.unwrap();
        assert!(!report.current);
        assert!(deleted.unwrap().is_empty());
        assert_eq!(manager.current_version().as_deref(), Some("v2"));
        assert_eq!(storage.keys().await.unwrap(), vec!["v2".to_string()]);
        let generations = manager.generations().await.unwrap();
        assert_eq!(generations.len(), 1);
        assert_eq!(generations[0].state, GenerationState::Current);
    }
}
