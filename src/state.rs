//! # state
//!
//! The shared application state injected into every Axum handler.
//!
//! Everything here is owned by `main` and passed down explicitly: the scan
//! registry, the scheduler and the notification channel are plain values, not
//! process-wide globals, so tests can build as many independent instances as
//! they need.

use std::sync::Arc;

use crate::broker::BrokerFactory;
use crate::config::ScanConfig;
use crate::engine::{ScanManager, Scheduler};
use crate::events::Notifier;
use crate::store::StrategyStore;

// ─── AppState ─────────────────────────────────────────────────────────────────

pub struct AppState {
    pub store: Arc<dyn StrategyStore>,

    /// Running scan loops, at most one per strategy.
    pub scans: ScanManager,

    /// Cron jobs that start scans.
    pub scheduler: Scheduler,

    /// Fan-out to `/ws/v1/updates` clients.
    pub notifier: Notifier,

    /// Used to reject strategies naming a broker this build cannot serve.
    pub brokers: Arc<dyn BrokerFactory>,
}

/// Convenience alias so handlers can write `State<SharedState>`.
pub type SharedState = Arc<AppState>;

/// Wires the scan manager and scheduler around `store` and `brokers`.
pub fn build_state(
    store: Arc<dyn StrategyStore>,
    brokers: Arc<dyn BrokerFactory>,
    scan: ScanConfig,
    broadcast_capacity: usize,
) -> SharedState {
    let notifier = Notifier::new(broadcast_capacity);
    let scans = ScanManager::new(scan, notifier.clone(), brokers.clone());
    let scheduler = Scheduler::new(scans.clone());

    Arc::new(AppState {
        store,
        scans,
        scheduler,
        notifier,
        brokers,
    })
}
