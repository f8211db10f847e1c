//! Asset Cache Origin Proxy
//!
//! This crate provides the network side of Asset Cache: the `Fetcher`
//! abstraction and the client that forwards requests to the origin server.

pub mod client;
pub mod error;

pub use client::{Fetcher, OriginClient, OriginClientConfig};
pub use error::ProxyError;
