//! # routes::scans
//!
//! Manual control of scan loops.
//!
//! | Method | Path                      | Description                          |
//! |--------|---------------------------|--------------------------------------|
//! | POST   | `/api/v1/scans/:id/run`     | Start a loop (202; 404, 400 inactive)|
//! | POST   | `/api/v1/scans/:id/stop`    | Stop a loop (always 200)             |
//! | GET    | `/api/v1/scans`             | Running loops                        |
//! | GET    | `/api/v1/scans/:id`         | Loop and cron state of one strategy  |
//! | GET    | `/api/v1/scans/:id/preview` | One snapshot through `first_scan`    |

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::debug;

use crate::engine::apply;
use crate::error::AppError;
use crate::models::Strategy;
use crate::state::{AppState, SharedState};

async fn find_strategy(state: &AppState, id: i64) -> Result<Strategy, AppError> {
    state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("strategy {id}")))
}

/// POST /api/v1/scans/:id/run
pub async fn run_scan(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let strategy = find_strategy(&state, id).await?;
    if !strategy.is_active {
        return Err(AppError::BadRequest(format!(
            "strategy '{}' is not active",
            strategy.name
        )));
    }

    let name = strategy.name.clone();
    let started = state.scans.start(Arc::new(strategy));
    let message = if started {
        format!("Scan for '{name}' started")
    } else {
        format!("Scan for '{name}' is already running")
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "ok":      true,
            "message": message,
            "started": started,
        })),
    ))
}

/// POST /api/v1/scans/:id/stop
pub async fn stop_scan(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let stopped = state.scans.stop(id);
    Json(json!({
        "ok":      true,
        "message": format!("Stop requested for strategy {id}"),
        "stopped": stopped,
    }))
}

/// GET /api/v1/scans
pub async fn list_scans(State(state): State<SharedState>) -> impl IntoResponse {
    let scans = state.scans.list();
    Json(json!({
        "ok":    true,
        "count": scans.len(),
        "scans": scans,
    }))
}

/// GET /api/v1/scans/:id
pub async fn scan_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let strategy = find_strategy(&state, id).await?;
    Ok(Json(json!({
        "ok":            true,
        "strategy_id":   id,
        "running":       state.scans.is_running(id),
        "state":         state.scans.state_of(id),
        "scheduled":     state.scheduler.is_scheduled(id),
        "cron_schedule": strategy.cron_schedule,
    })))
}

/// GET /api/v1/scans/:id/preview
///
/// Fetches one snapshot and filters it with `first_scan`, without starting a
/// loop or publishing events.  Works for inactive strategies too.
pub async fn preview_scan(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let strategy = find_strategy(&state, id).await?;
    let client = state
        .brokers
        .connect(&strategy.broker)
        .map_err(|e| AppError::Unprocessable(e.to_string()))?;

    let snapshot = client
        .fetch_snapshot(&strategy.market)
        .await
        .map_err(|e| AppError::Upstream(format!("{}: {e}", client.name())))?;
    let matched = apply(&snapshot, strategy.scan_rules.first_scan.as_ref())
        .map_err(|e| AppError::Unprocessable(format!("first_scan: {e}")))?;

    debug!(
        strategy_id = id,
        snapshot = snapshot.len(),
        matched = matched.len(),
        "preview computed"
    );

    Ok(Json(json!({
        "ok":          true,
        "strategy_id": id,
        "broker":      client.name(),
        "market":      strategy.market,
        "snapshot":    snapshot.len(),
        "matches":     matched.symbols().collect::<Vec<_>>(),
    })))
}
