use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{debug, warn};
use utoipa::OpenApi;

use crate::models::*;
use crate::{ApiDoc, AppState};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// Health check
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List sticky client mappings
#[utoipa::path(
    get,
    path = "/api/sticky-mappings",
    params(StickyMappingQuery),
    responses(
        (status = 200, description = "Sticky mappings", body = StickyMappingList),
        (status = 500, description = "Sticky storage error", body = ErrorResponse)
    ),
    tag = "routing"
)]
pub async fn list_sticky_mappings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StickyMappingQuery>,
) -> Result<Json<StickyMappingList>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Listing sticky mappings with filters: {:?}", query);

    let entries = state.sticky.entries().await.map_err(|e| {
        warn!("Failed to list sticky mappings: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Sticky storage error: {}", e),
                code: Some("STORAGE_ERROR".to_string()),
            }),
        )
    })?;

    let matching: Vec<StickyMapping> = entries
        .into_iter()
        .map(|entry| StickyMapping {
            client_key: entry.client_key,
            route: entry.route.to_string(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
        .filter(|m| query.route.as_ref().map_or(true, |route| &m.route == route))
        .collect();

    let total = matching.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let mappings = matching.into_iter().skip(offset).take(limit).collect();

    Ok(Json(StickyMappingList { mappings, total }))
}

/// Connection counters per destination domain
#[utoipa::path(
    get,
    path = "/api/domains",
    responses(
        (status = 200, description = "Domain counters (empty when the tracer is disabled)", body = DomainStats)
    ),
    tag = "routing"
)]
pub async fn list_domains(State(state): State<Arc<AppState>>) -> Json<DomainStats> {
    let domains: std::collections::BTreeMap<String, u64> =
        state.tracker.dump().into_iter().collect();
    let total_requests = domains.values().sum();

    Json(DomainStats {
        domains,
        total_requests,
    })
}

/// OpenAPI document
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
