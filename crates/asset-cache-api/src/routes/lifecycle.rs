//! Generation lifecycle routes

use asset_cache_core::{CacheStats, GenerationInfo, InstallReport, expand_base_resources};
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::auth::RequireManagementToken;
use crate::error::ApiError;
use crate::state::AppState;

// ==================== Types ====================

/// Install request
#[derive(Deserialize)]
pub struct InstallRequest {
    pub version: String,
    /// Resources to seed; the configured base list when absent
    #[serde(default)]
    pub resources: Option<Vec<String>>,
}

/// Activate request
#[derive(Deserialize)]
pub struct ActivateRequest {
    pub version: String,
}

/// Activate response
#[derive(Serialize)]
pub struct ActivateResponse {
    pub current: String,
    pub deleted: Vec<String>,
}

/// Generation list response
#[derive(Serialize)]
pub struct GenerationsResponse {
    pub current: Option<String>,
    pub generations: Vec<GenerationInfo>,
}

/// Statistics response
#[derive(Serialize)]
pub struct StatsResponse {
    pub current: Option<String>,
    #[serde(flatten)]
    pub stats: CacheStats,
    pub hit_rate: f64,
}

// ==================== Routes ====================

/// GET /_asset-cache/generations
async fn list_generations(
    State(state): State<AppState>,
) -> Result<Json<GenerationsResponse>, ApiError> {
    let generations = state.manager.generations().await?;

    Ok(Json(GenerationsResponse {
        current: state.manager.current_version(),
        generations,
    }))
}

/// GET /_asset-cache/stats
async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.manager.stats().await;
    let lookups = stats.hit_count + stats.miss_count;
    let hit_rate = if lookups > 0 {
        stats.hit_count as f64 / lookups as f64
    } else {
        0.0
    };

    Json(StatsResponse {
        current: state.manager.current_version(),
        stats,
        hit_rate,
    })
}

/// POST /_asset-cache/install
async fn install(
    _auth: RequireManagementToken,
    State(state): State<AppState>,
    Json(request): Json<InstallRequest>,
) -> Result<Json<InstallReport>, ApiError> {
    let version = request.version.trim();
    if version.is_empty() {
        return Err(ApiError::BadRequest("version must not be empty".to_string()));
    }

    let resources = match request.resources {
        Some(resources) => resources,
        None => expand_base_resources(&state.base_resources, version),
    };

    info!("Install of {} requested ({} resources)", version, resources.len());
    let report = state.manager.install(version, &resources).await?;
    Ok(Json(report))
}

/// POST /_asset-cache/activate
async fn activate(
    _auth: RequireManagementToken,
    State(state): State<AppState>,
    Json(request): Json<ActivateRequest>,
) -> Result<Json<ActivateResponse>, ApiError> {
    let version = request.version.trim();
    if version.is_empty() {
        return Err(ApiError::BadRequest("version must not be empty".to_string()));
    }

    info!("Activation of {} requested", version);
    let deleted = state.manager.activate(version).await?;

    Ok(Json(ActivateResponse {
        current: version.to_string(),
        deleted,
    }))
}

/// Create lifecycle routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/_asset-cache/generations", get(list_generations))
        .route("/_asset-cache/stats", get(get_stats))
        .route("/_asset-cache/install", post(install))
        .route("/_asset-cache/activate", post(activate))
}
