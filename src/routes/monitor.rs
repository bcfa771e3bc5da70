//! # routes::monitor
//!
//! Live feed and liveness endpoints for the dashboard.
//!
//! | Method   | Path             | Description                          |
//! |----------|------------------|--------------------------------------|
//! | GET (WS) | `/ws/v1/updates` | Real-time scan event stream          |
//! | GET      | `/health-check`  | Liveness check                       |
//! | GET      | `/`              | Service banner                       |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::state::SharedState;

// ─── WebSocket Handler ────────────────────────────────────────────────────────

/// Upgrades to a WebSocket and forwards every [`crate::events::ScanEvent`] as a
/// JSON text frame.
pub async fn ws_updates(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.notifier.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 WebSocket client connected");

    // ── Current loops, so a fresh dashboard does not start blank ─────────────
    let snapshot = json!({
        "event":   "snapshot",
        "payload": { "scans": state.scans.list() },
    })
    .to_string();

    if sender.send(Message::Text(snapshot)).await.is_err() {
        return;
    }

    // ── Event Loop ────────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 WebSocket client disconnected");
}

// ─── Liveness ─────────────────────────────────────────────────────────────────

/// GET /health-check
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "ok":            true,
        "status":        "ok",
        "running_scans": state.scans.list().len(),
    }))
}

/// GET /
pub async fn root() -> impl IntoResponse {
    Json(json!({
        "ok":      true,
        "service": "tbot",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
