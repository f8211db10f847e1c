//! Asset Cache HTTP API
//!
//! This crate provides the Axum-based HTTP surface for Asset Cache: the
//! cache-first fallback route answering every client request, plus health,
//! metrics and generation lifecycle endpoints.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle};
