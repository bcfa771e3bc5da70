//! # engine::manager
//!
//! Owns the running scan loops, at most one per strategy.
//!
//! The registry is a `std::sync::Mutex<HashMap>` that is never held across an
//! `.await`: `start` checks and inserts under one lock, so two concurrent
//! starts of the same strategy spawn one loop.  A loop that exits on its own
//! removes its entry on the way out, but only if the entry still carries its
//! run id, so it never evicts a newer run of the same strategy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::BrokerFactory;
use crate::config::ScanConfig;
use crate::engine::cancel::CancelToken;
use crate::engine::scan::{run_scan, ScanContext, ScanState, StateCell};
use crate::events::Notifier;
use crate::models::Strategy;

struct ScanHandle {
    run_id: Uuid,
    strategy_name: String,
    started_at: DateTime<Utc>,
    cancel: CancelToken,
    state: StateCell,
    task: JoinHandle<()>,
}

/// A running loop as listed by `GET /api/v1/scans`.
#[derive(Debug, Clone, Serialize)]
pub struct ScanInfo {
    pub strategy_id: i64,
    pub strategy_name: String,
    pub run_id: Uuid,
    pub state: ScanState,
    pub started_at: DateTime<Utc>,
}

struct ManagerInner {
    scans: Mutex<HashMap<i64, ScanHandle>>,
    config: ScanConfig,
    notifier: Notifier,
    brokers: Arc<dyn BrokerFactory>,
}

impl ManagerInner {
    fn scans(&self) -> MutexGuard<'_, HashMap<i64, ScanHandle>> {
        self.scans.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct ScanManager {
    inner: Arc<ManagerInner>,
}

/// Removes a finished loop's registry entry if it is still the current run.
struct EntryGuard {
    manager: Weak<ManagerInner>,
    strategy_id: i64,
    run_id: Uuid,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let mut scans = inner.scans();
        if scans
            .get(&self.strategy_id)
            .is_some_and(|h| h.run_id == self.run_id)
        {
            scans.remove(&self.strategy_id);
            debug!(strategy_id = self.strategy_id, "scan entry released");
        }
    }
}

impl ScanManager {
    pub fn new(config: ScanConfig, notifier: Notifier, brokers: Arc<dyn BrokerFactory>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                scans: Mutex::new(HashMap::new()),
                config,
                notifier,
                brokers,
            }),
        }
    }

    /// Starts a loop for `strategy` unless one is already running.  Returns
    /// `true` when a new loop was spawned.
    pub fn start(&self, strategy: Arc<Strategy>) -> bool {
        let mut scans = self.inner.scans();
        if scans
            .get(&strategy.id)
            .is_some_and(|h| !h.task.is_finished())
        {
            debug!(strategy_id = strategy.id, "scan already running");
            return false;
        }

        let run_id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let state = StateCell::default();
        let ctx = ScanContext {
            strategy: strategy.clone(),
            run_id,
            config: self.inner.config.clone(),
            notifier: self.inner.notifier.clone(),
            brokers: self.inner.brokers.clone(),
            cancel: cancel.clone(),
            state: state.clone(),
        };
        let guard = EntryGuard {
            manager: Arc::downgrade(&self.inner),
            strategy_id: strategy.id,
            run_id,
        };

        let task = tokio::spawn(async move {
            let _guard = guard;
            run_scan(ctx).await;
        });

        info!(strategy_id = strategy.id, %run_id, "▶️ Scan loop spawned");
        scans.insert(
            strategy.id,
            ScanHandle {
                run_id,
                strategy_name: strategy.name.clone(),
                started_at: Utc::now(),
                cancel,
                state,
                task,
            },
        );
        true
    }

    /// Cancels the loop for `strategy_id`.  Returns `false` (and does
    /// nothing else) when no loop is running.
    pub fn stop(&self, strategy_id: i64) -> bool {
        let handle = self.inner.scans().remove(&strategy_id);
        match handle {
            Some(handle) if !handle.task.is_finished() => {
                handle.cancel.cancel();
                info!(strategy_id, run_id = %handle.run_id, "Scan stop requested");
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self, strategy_id: i64) -> bool {
        self.inner
            .scans()
            .get(&strategy_id)
            .is_some_and(|h| !h.task.is_finished())
    }

    pub fn state_of(&self, strategy_id: i64) -> Option<ScanState> {
        self.inner.scans().get(&strategy_id).map(|h| h.state.get())
    }

    /// Running loops ordered by strategy id.
    pub fn list(&self) -> Vec<ScanInfo> {
        let mut out: Vec<ScanInfo> = self
            .inner
            .scans()
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(id, h)| ScanInfo {
                strategy_id: *id,
                strategy_name: h.strategy_name.clone(),
                run_id: h.run_id,
                state: h.state.get(),
                started_at: h.started_at,
            })
            .collect();
        out.sort_by_key(|info| info.strategy_id);
        out
    }

    /// Cancels every loop and waits for all of them to exit.
    pub async fn stop_all(&self) {
        let handles: Vec<ScanHandle> = self.inner.scans().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Stopping all scans");
        for handle in &handles {
            handle.cancel.cancel();
        }
        join_all(handles.into_iter().map(|h| h.task)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{StaticBroker, StaticBrokers};
    use crate::models::{Frame, ScanRules};
    use std::time::Duration;

    fn manager(notifier: Notifier) -> ScanManager {
        let broker = StaticBroker::new().snapshot(Frame::standard().with_row("KRW-BTC", vec![1.0; 6]));
        let config = ScanConfig {
            scan_interval: Duration::from_millis(10),
            empty_snapshot_retry: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            ..ScanConfig::default()
        };
        ScanManager::new(config, notifier, Arc::new(StaticBrokers(Arc::new(broker))))
    }

    fn strategy(id: i64, broker: &str) -> Arc<Strategy> {
        Arc::new(Strategy::fixture(id, "s", broker, ScanRules::default()))
    }

    async fn eventually(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition within deadline");
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let scans = manager(Notifier::new(64));
        assert!(scans.start(strategy(1, "static")));
        assert!(!scans.start(strategy(1, "static")));
        assert_eq!(scans.list().len(), 1);
        assert!(scans.is_running(1));
        scans.stop_all().await;
        assert!(scans.list().is_empty());
    }

    #[tokio::test]
    async fn stop_unknown_is_silent() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        let scans = manager(notifier);

        assert!(!scans.stop(42));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_then_start_spawns_fresh_run() {
        let scans = manager(Notifier::new(64));
        scans.start(strategy(1, "static"));
        let first_run = scans.list()[0].run_id;

        assert!(scans.stop(1));
        assert!(!scans.is_running(1));
        assert!(scans.start(strategy(1, "static")));
        let second_run = scans.list()[0].run_id;
        assert_ne!(first_run, second_run);

        // The cancelled run's exit must not evict the new entry.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(scans.is_running(1));
        assert_eq!(scans.list()[0].run_id, second_run);
        scans.stop_all().await;
    }

    #[tokio::test]
    async fn finished_loops_release_their_entry() {
        let scans = manager(Notifier::new(64));
        assert!(scans.start(strategy(5, "unknown-broker")));
        eventually(|| scans.state_of(5).is_none()).await;
        assert!(!scans.is_running(5));
        assert!(scans.start(strategy(5, "static")));
        scans.stop_all().await;
    }

    #[tokio::test]
    async fn list_reports_state() {
        let scans = manager(Notifier::new(64));
        scans.start(strategy(2, "static"));
        scans.start(strategy(1, "static"));
        eventually(|| scans.state_of(1) == Some(ScanState::Running)).await;

        let ids: Vec<i64> = scans.list().iter().map(|i| i.strategy_id).collect();
        assert_eq!(ids, vec![1, 2]);
        scans.stop_all().await;
    }
}
