//! Application state

use asset_cache_core::AssetCacheManager;
use std::sync::Arc;

/// Prometheus handle rendering the metrics endpoint
pub type MetricsHandle = metrics_exporter_prometheus::PrometheusHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<AssetCacheManager>,
    /// Seed list used by the install endpoint when none is given; may contain `{build}`
    pub base_resources: Arc<Vec<String>>,
    /// Bearer token for install and activate; those routes are disabled without one
    pub management_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(manager: Arc<AssetCacheManager>, base_resources: Vec<String>) -> Self {
        Self {
            manager,
            base_resources: Arc::new(base_resources),
            management_token: None,
        }
    }

    /// Enable the install and activate routes behind a bearer token
    pub fn with_management_token(mut self, token: Option<String>) -> Self {
        self.management_token = token.filter(|t| !t.is_empty()).map(Arc::from);
        self
    }
}
