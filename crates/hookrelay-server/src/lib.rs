//! HTTP front end for the forwarding gateway.
//!
//! Receives service hook notifications on `POST /api/forward?topic=...`,
//! runs them through the filter pipeline and publishes the accepted ones to
//! the broker. `GET /health` reports whether the broker session is up.

mod error;
mod forward;

pub use error::{AppError, ErrorResponse};
pub use forward::{ForwardMode, ForwardResponse};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hookrelay_broker::Publisher;
use hookrelay_core::Pipeline;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Server state shared across handlers.
pub struct AppState {
    pub pipeline: Pipeline,
    pub mode: ForwardMode,
    pub publisher: Arc<dyn Publisher>,
}

impl AppState {
    #[must_use]
    pub fn new(pipeline: Pipeline, mode: ForwardMode, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            pipeline,
            mode,
            publisher,
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/forward", post(forward::forward))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
///
/// # Errors
/// Returns error if the server encounters an I/O error.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(address = %addr, mode = %state.mode, "Starting forward server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Forward server stopped");
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub broker_connected: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connected = state.publisher.is_connected();
    let (code, status) = if connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            broker_connected: connected,
        }),
    )
}
