//! Asset Cache Storage Layer
//!
//! This crate provides the cache store abstraction for Asset Cache:
//! named cache generations holding request-keyed responses, with
//! in-memory and local disk backends.

pub mod backend;
pub mod entry;
pub mod error;
pub mod local;
pub mod memory;

pub use backend::{CacheStorage, Generation};
pub use entry::{CachedEntry, CachedRequest, CachedResponse};
pub use error::StorageError;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
