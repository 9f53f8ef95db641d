use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::{IntoParams, ToSchema};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
}

/// A client pinned to a route
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StickyMapping {
    /// Client IP address
    pub client_key: String,
    /// Route token: direct, tier1, tier2 or tier3
    pub route: String,
    /// When the client was first pinned
    pub created_at: DateTime<Utc>,
    /// When the route was last written
    pub updated_at: DateTime<Utc>,
}

/// Sticky mapping list response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StickyMappingList {
    pub mappings: Vec<StickyMapping>,
    /// Matching mappings before pagination
    pub total: usize,
}

/// Query parameters for listing sticky mappings
#[derive(Debug, Clone, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct StickyMappingQuery {
    /// Only mappings to this route
    pub route: Option<String>,
    /// Pagination offset (default: 0)
    pub offset: Option<usize>,
    /// Pagination limit (default: 100, max: 1000)
    pub limit: Option<usize>,
}

/// Per-domain connection counters
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DomainStats {
    pub domains: BTreeMap<String, u64>,
    /// Sum of all counters
    pub total_requests: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
