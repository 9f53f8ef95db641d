//! Read-only management API
//!
//! Serves snapshots of the sticky store and the domain counters:
//! - `GET /api/health`
//! - `GET /api/sticky-mappings`
//! - `GET /api/domains`
//! - `GET /api/openapi.json`

pub mod handlers;
pub mod models;

use axum::{routing::get, Router};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

use forwarder_sticky::StickyMapper;
use forwarder_tracer::DomainTracker;

/// Application state shared across handlers
pub struct AppState {
    pub sticky: StickyMapper,
    pub tracker: Arc<dyn DomainTracker>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Forwarder API",
        version = "0.1.0",
        description = "Read-only view of the forwarder's routing state"
    ),
    paths(
        handlers::health_check,
        handlers::list_sticky_mappings,
        handlers::list_domains,
    ),
    components(
        schemas(
            models::HealthResponse,
            models::StickyMapping,
            models::StickyMappingList,
            models::DomainStats,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "routing", description = "Sticky mappings and domain counters"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        sticky: StickyMapper,
        tracker: Arc<dyn DomainTracker>,
    ) -> Self {
        let state = Arc::new(AppState { sticky, tracker });
        Self { config, state }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/sticky-mappings", get(handlers::list_sticky_mappings))
            .route("/api/domains", get(handlers::list_domains))
            .route("/api/openapi.json", get(handlers::openapi_json))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Binds the API address, then serves until the future is dropped
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI document: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        axum::serve(listener, router)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
