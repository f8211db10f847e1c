//! Cache-first handling of every request not claimed by another route

use asset_cache_core::request_key;
use asset_cache_storage::CachedRequest;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Uri},
    response::Response,
};
use bytes::Bytes;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Response header reporting where the body came from
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-asset-cache");

/// Fallback handler: answer from the current generation or the origin
pub async fn handle_fetch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = CachedRequest {
        method,
        key: request_key(&uri),
        headers,
        body,
    };

    let handled = state.manager.handle(&request).await?;
    let source = handled.source.as_str();
    debug!("{} {} -> {} ({})", request.method, request.key, handled.response.status, source);

    let mut response = Response::new(Body::from(handled.response.body));
    *response.status_mut() = handled.response.status;
    *response.headers_mut() = handled.response.headers;
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static(source));

    Ok(response)
}
