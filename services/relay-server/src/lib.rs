pub mod batcher;
pub mod config;
pub mod connection;
pub mod error;
pub mod ingest;
pub mod orientation;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod stats;
pub mod ws;
pub mod ws_common;

pub use state::AppState;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Wires the five role endpoints of §6 plus a liveness probe onto one
/// router, matching the teacher's `Router::new().route(...).with_state(state)`
/// shape. Any path outside the five is an `unknown_path` protocol error
/// (§4.1) — axum's router fallback already gives us exactly that.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/pocket-parrot", get(ws::sender::upgrade))
        .route("/dashboard", get(ws::dashboard::upgrade))
        .route("/listener", get(ws::listener::upgrade))
        .route("/orientation", get(ws::orientation::upgrade))
        .route("/bulk", get(ws::bulk::upgrade))
        .route("/healthz", get(health::healthz))
        .fallback(unknown_path)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn unknown_path() -> impl IntoResponse {
    use axum::http::StatusCode;
    (StatusCode::NOT_FOUND, relay_protocol::reason_codes::UNKNOWN_PATH)
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
}
