//! API routes

mod auth;
mod fetch;
mod health;
mod lifecycle;
pub mod metrics;

pub use fetch::CACHE_STATUS_HEADER;

use axum::{Router, extract::DefaultBodyLimit};
use std::sync::Arc;

use crate::state::{AppState, MetricsHandle};

/// Largest request body forwarded to the origin (64 MiB)
const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Create the main router
///
/// Lifecycle and health routes are matched first; every other request is
/// answered cache-first by the fallback.
pub fn create_router(state: AppState, metrics_handle: Option<Arc<MetricsHandle>>) -> Router {
    let mut router = Router::new()
        .merge(health::routes())
        .merge(lifecycle::routes())
        .fallback(fetch::handle_fetch)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE));

    if let Some(handle) = metrics_handle {
        router = router.merge(metrics::routes(handle));
    }

    router
}
