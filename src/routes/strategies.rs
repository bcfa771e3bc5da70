//! # routes::strategies
//!
//! Strategy CRUD.
//!
//! | Method | Path                      | Description                        |
//! |--------|---------------------------|------------------------------------|
//! | POST   | `/api/v1/strategies`      | Create (201)                       |
//! | GET    | `/api/v1/strategies`      | List, `?skip=&limit=`              |
//! | GET    | `/api/v1/strategies/:id`  | Fetch one                          |
//! | PUT    | `/api/v1/strategies/:id`  | Partial update                     |
//! | DELETE | `/api/v1/strategies/:id`  | Delete, stopping its scan and cron |
//!
//! Rule trees, the broker id and the cron expression are validated before
//! anything is stored (422 on failure).  Every write re-schedules the
//! strategy; an update restarts a running scan so the new rules take effect.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::engine::{compile, parse_cron};
use crate::error::AppError;
use crate::models::{Strategy, StrategyCreate, StrategyUpdate};
use crate::state::{AppState, SharedState};

#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Rejects a strategy the engine could never run.
fn validate(state: &AppState, strategy: &Strategy) -> Result<(), AppError> {
    if strategy.name.trim().is_empty() {
        return Err(AppError::Unprocessable("name must not be empty".into()));
    }
    if !state.brokers.supports(&strategy.broker) {
        return Err(AppError::Unprocessable(format!(
            "unsupported broker '{}'",
            strategy.broker
        )));
    }

    let rules = &strategy.scan_rules;
    for (label, root) in [("first_scan", &rules.first_scan), ("second_scan", &rules.second_scan)] {
        compile(root.as_ref()).map_err(|e| AppError::Unprocessable(format!("{label}: {e}")))?;
    }

    if let Some(cron) = &strategy.cron_schedule {
        parse_cron(cron).map_err(|e| AppError::Unprocessable(e.to_string()))?;
    }
    Ok(())
}

fn reschedule(state: &AppState, strategy: &Strategy) {
    if let Err(e) = state.scheduler.schedule(Arc::new(strategy.clone())) {
        warn!(strategy_id = strategy.id, error = %e, "strategy not scheduled");
    }
}

/// POST /api/v1/strategies
pub async fn create_strategy(
    State(state): State<SharedState>,
    Json(input): Json<StrategyCreate>,
) -> Result<impl IntoResponse, AppError> {
    validate(&state, &input.clone().into_strategy(0))?;

    let strategy = state.store.create(input).await?;
    reschedule(&state, &strategy);

    info!(strategy_id = strategy.id, name = %strategy.name, "📝 Strategy created");
    Ok((StatusCode::CREATED, Json(strategy)))
}

/// GET /api/v1/strategies
pub async fn list_strategies(
    State(state): State<SharedState>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<Strategy>>, AppError> {
    Ok(Json(state.store.list(page.skip, page.limit).await?))
}

/// GET /api/v1/strategies/:id
pub async fn get_strategy(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Strategy>, AppError> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("strategy {id}")))
}

/// PUT /api/v1/strategies/:id
pub async fn update_strategy(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(patch): Json<StrategyUpdate>,
) -> Result<Json<Strategy>, AppError> {
    let mut preview = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("strategy {id}")))?;
    patch.clone().apply_to(&mut preview);
    validate(&state, &preview)?;

    let updated = state
        .store
        .update(id, patch)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("strategy {id}")))?;
    reschedule(&state, &updated);

    // A running loop holds the old snapshot; restart it on the new one.
    if state.scans.stop(id) && updated.is_active {
        state.scans.start(Arc::new(updated.clone()));
    }

    info!(strategy_id = id, "📝 Strategy updated");
    Ok(Json(updated))
}

/// DELETE /api/v1/strategies/:id
pub async fn delete_strategy(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Strategy>, AppError> {
    let deleted = state
        .store
        .delete(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("strategy {id}")))?;

    state.scheduler.unschedule(id);
    state.scans.stop(id);

    info!(strategy_id = id, "🗑️ Strategy deleted");
    Ok(Json(deleted))
}
