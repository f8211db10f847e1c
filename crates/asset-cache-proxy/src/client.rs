//! Origin client

use asset_cache_storage::{CachedRequest, CachedResponse};
use async_trait::async_trait;
use http::{HeaderMap, HeaderName, header};
use reqwest::{Client, redirect};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::ProxyError;

/// Source of network responses
///
/// Any HTTP status is a successful fetch; only transport failures are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &CachedRequest) -> Result<CachedResponse, ProxyError>;
}

/// Origin client configuration
#[derive(Clone, Debug)]
pub struct OriginClientConfig {
    /// Base URL of the origin server
    pub url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Skip TLS certificate verification
    pub skip_tls_verify: bool,
}

/// Client forwarding requests to the origin server
pub struct OriginClient {
    base: String,
    client: Client,
}

impl OriginClient {
    /// Create a new origin client
    pub fn new(config: OriginClientConfig) -> Result<Self, ProxyError> {
        Url::parse(&config.url)
            .map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", config.url, e)))?;

        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(config.timeout);

        if config.skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build()?;

        info!("Created origin client for {}", config.url);

        Ok(Self {
            base: config.url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Resolve a request key (path and query) against the origin base URL
    fn target_url(&self, key: &str) -> Result<Url, ProxyError> {
        let url = if key.starts_with('/') {
            format!("{}{}", self.base, key)
        } else {
            format!("{}/{}", self.base, key)
        };
        Url::parse(&url).map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", url, e)))
    }
}

#[async_trait]
impl Fetcher for OriginClient {
    async fn fetch(&self, request: &CachedRequest) -> Result<CachedResponse, ProxyError> {
        let url = self.target_url(&request.key)?;
        debug!("Fetching {} {}", request.method, url);

        let response = self
            .client
            .request(request.method.clone(), url)
            .headers(end_to_end_headers(&request.headers))
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = end_to_end_headers(response.headers());
        let body = response.bytes().await?;

        debug!(
            "Origin answered {} with {} ({} bytes)",
            request.key,
            status,
            body.len()
        );

        Ok(CachedResponse::new(status, headers, body))
    }
}

/// Check whether a header only applies to a single connection
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::HOST
        || *name == header::CONTENT_LENGTH
        || *name == header::TE
        || *name == header::TRAILER
        || *name == header::TRANSFER_ENCODING
        || *name == header::UPGRADE
        || *name == header::PROXY_AUTHORIZATION
        || *name == header::PROXY_AUTHENTICATE
        || name.as_str() == "keep-alive"
}

/// Copy every header that should cross the proxy
fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}
