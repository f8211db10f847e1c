//! Asset Cache Core Business Logic
//!
//! This crate provides the core functionality for Asset Cache: the
//! cache-first request path, generation install/activate lifecycle and
//! eviction of superseded schema revisions.

pub mod cache;
pub mod error;
pub mod key;
pub mod resources;

pub use cache::{
    AssetCacheManager, CacheStats, GenerationInfo, GenerationState, Handled, InstallReport,
    ResponseSource,
};
pub use error::{CoreError, InstallFailure};
pub use key::{VersionedKey, normalize_key, request_key};
pub use resources::{default_base_resources, expand_base_resources};
