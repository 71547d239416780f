//! Transport: the concrete socket boundary and HTTP debug
//! surface, built on axum with a standard router and middleware stack.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::registry::RoomRegistry;

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
struct AppState {
    registry: Arc<RoomRegistry>,
}

/// Build the axum router: `/ws` for gameplay traffic, `/healthz` and
/// `/debug/stats` for operators.
pub fn router(registry: Arc<RoomRegistry>) -> Router {
    let state = AppState { registry };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/ws", get(handle_ws_upgrade))
        .route("/healthz", get(handle_healthz))
        .route("/debug/stats", get(handle_debug_stats))
        .with_state(state)
        .layer(cors)
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(REQUEST_TIMEOUT_SECS)))
}

/// Bind `addr` and serve the router until the given shutdown signal
/// resolves.
pub async fn serve(
    addr: std::net::SocketAddr,
    registry: Arc<RoomRegistry>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn handle_ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::session::run(socket, state.registry))
}

async fn handle_healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn handle_debug_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.get_stats().await)
}
