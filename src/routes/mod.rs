//! HTTP surface: strategy CRUD, scan control and the live update feed.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::SharedState;

pub mod monitor;
pub mod scans;
pub mod strategies;

/// Builds the full router.
pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Strategies ───────────────────────────────────────────────────────
        .route(
            "/api/v1/strategies",
            post(strategies::create_strategy).get(strategies::list_strategies),
        )
        .route(
            "/api/v1/strategies/:id",
            get(strategies::get_strategy)
                .put(strategies::update_strategy)
                .delete(strategies::delete_strategy),
        )
        // ── Scans ────────────────────────────────────────────────────────────
        .route("/api/v1/scans", get(scans::list_scans))
        .route("/api/v1/scans/:id", get(scans::scan_status))
        .route("/api/v1/scans/:id/preview", get(scans::preview_scan))
        .route("/api/v1/scans/:id/run", post(scans::run_scan))
        .route("/api/v1/scans/:id/stop", post(scans::stop_scan))
        // ── Monitor ──────────────────────────────────────────────────────────
        .route("/ws/v1/updates", get(monitor::ws_updates))
        .route("/health-check", get(monitor::health_check))
        .route("/", get(monitor::root))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
