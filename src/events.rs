//! # events
//!
//! Defines [`ScanEvent`], every event the scanner broadcasts to dashboard
//! clients over `/ws/v1/updates`.
//!
//! Events travel through a `tokio::sync::broadcast::Sender<String>` as
//! pre-serialized JSON, so each client only clones a string.  Wire envelope:
//!
//! ```json
//! { "event": "scan_result_found", "payload": { ... } }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusPayload {
    pub strategy_id: i64,
    pub strategy_name: String,
    pub run_id: Uuid,
    pub status: ScanStatus,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot values of a matched symbol.  `price` is the `close` column.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MatchDetails {
    pub price: f64,
    pub volume: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchPayload {
    pub strategy_id: i64,
    pub strategy_name: String,
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub details: MatchDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub level: Level,
    pub message: String,
    pub strategy_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Everything a dashboard receives in real time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ScanEvent {
    /// A scan loop started or stopped.
    ScanStatusUpdate(StatusPayload),

    /// A symbol survived both phases of a cycle.
    ScanResultFound(MatchPayload),

    Notification(NotificationPayload),
}

impl ScanEvent {
    pub fn notification(level: Level, message: impl Into<String>, strategy_id: Option<i64>) -> Self {
        ScanEvent::Notification(NotificationPayload {
            level,
            message: message.into(),
            strategy_id,
            timestamp: Utc::now(),
        })
    }

    /// JSON text frame sent to WebSocket clients.
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"serialization_error","payload":{}}"#.to_string())
    }
}

// ─── Notifier ─────────────────────────────────────────────────────────────────

/// Fire-and-forget fan-out of [`ScanEvent`]s.  Publishing with no subscriber
/// connected is not an error.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<String>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: &ScanEvent) {
        let receivers = self.tx.send(event.to_json()).unwrap_or(0);
        trace!(receivers, "event published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}
