//! Management token extractor

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Extractor guarding routes that change cache generations
///
/// Requires `Authorization: Bearer <token>` matching the configured
/// management token. Without a configured token these routes are disabled.
pub struct RequireManagementToken;

impl<S> FromRequestParts<S> for RequireManagementToken
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);

        let Some(expected) = app_state.management_token.as_deref() else {
            debug!("Rejected management request: no token configured");
            return Err(ApiError::Forbidden);
        };

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        if Sha256::digest(token.as_bytes()) != Sha256::digest(expected.as_bytes()) {
            return Err(ApiError::Unauthorized);
        }

        Ok(RequireManagementToken)
    }
}
