//! Router assembly and the HTTP server loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use swarmcast_core::StreamService;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::handlers::{get_playlist, get_segment, head_playlist, job_status, reset_job, start_job};

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StreamService>,
}

impl AppState {
    pub fn new(service: Arc<StreamService>) -> Self {
        Self { service }
    }
}

/// Errors while starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server stopped unexpectedly")]
    Serve(#[source] std::io::Error),
}

/// Builds the API router under the configured prefix.
pub fn router(state: AppState) -> Router {
    let prefix = state.service.context().config.server.api_prefix;

    Router::new()
        .route(&format!("{prefix}/start"), post(start_job))
        .route(
            &format!("{prefix}/{{id}}/playlist"),
            get(get_playlist).head(head_playlist),
        )
        .route(
            &format!("{prefix}/{{id}}/segments/{{rendition}}/{{file}}"),
            get(get_segment),
        )
        .route(&format!("{prefix}/{{id}}/status"), get(job_status))
        .route(&format!("{prefix}/{{id}}/reset"), post(reset_job))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API on `addr` until the listener fails.
///
/// # Errors
///
/// - `ServerError::Bind` - Address unavailable
/// - `ServerError::Serve` - Accept loop failed
pub async fn run_server(service: Arc<StreamService>, addr: SocketAddr) -> Result<(), ServerError> {
    let app = router(AppState::new(service));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(address = %addr, "Swarmcast API listening");

    axum::serve(listener, app).await.map_err(ServerError::Serve)
}
