//! Cached request and response model

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode};

/// A request as seen by the cache
///
/// `key` is the path and query of the request URI. Lookups ignore the
/// method; it is kept so the request can be forwarded unchanged.
#[derive(Debug, Clone)]
pub struct CachedRequest {
    pub method: Method,
    pub key: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedRequest {
    /// Build a bodiless GET request for a key
    pub fn get(key: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            key: key.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// A captured response: status, headers and the full body
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Only a plain 200 is ever written to a generation
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK
    }
}

/// A stored entry: the response plus the metadata of the request that produced it
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub key: String,
    pub method: Method,
    pub response: CachedResponse,
    pub stored_at: DateTime<Utc>,
}

impl CachedEntry {
    pub fn new(request: &CachedRequest, response: CachedResponse) -> Self {
        Self {
            key: request.key.clone(),
            method: request.method.clone(),
            response,
            stored_at: Utc::now(),
        }
    }
}
