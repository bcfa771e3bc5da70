//! # engine::scan
//!
//! The two-phase scan loop one strategy runs in its own task.
//!
//! ```text
//!  Starting ──▶ Running ──(cycle)──▶ Running ... ──cancel──▶ Stopping ──▶ Stopped
//!                  │  ▲
//!        transient │  │ next cycle
//!                  ▼  │
//!                 Errored
//! ```
//!
//! A cycle:
//! 1. fetch the market snapshot (empty → retry after `empty_snapshot_retry`)
//! 2. phase 1: `first_scan` over the snapshot
//! 3. phase 2: for each survivor, fetch every timeframe `second_scan` tags;
//!    the symbol passes only if all of them have data (and, in
//!    [`Phase2Mode::Evaluate`], the tree holds on the latest candles)
//! 4. publish one `scan_result_found` per survivor, in snapshot order
//! 5. sleep `scan_interval`
//!
//! Rule errors stop the loop.  Broker errors back off and retry.  Every exit
//! path, including a panic, publishes the final `stopped` status.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures_util::{future::join_all, stream, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerError, BrokerFactory, MarketData};
use crate::config::{Phase2Mode, ScanConfig};
use crate::engine::cancel::CancelToken;
use crate::engine::compiler::{CompiledTree, Predicate, RowView, RuleError};
use crate::engine::timeframe::extract_timeframes;
use crate::events::{Level, MatchDetails, MatchPayload, Notifier, ScanEvent, ScanStatus, StatusPayload};
use crate::models::{Frame, Row, ScanRules, Strategy, Timeframe, STANDARD_COLUMNS};

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    #[default]
    Starting,
    Running,
    /// The last cycle failed transiently; the loop is backing off.
    Errored,
    Stopping,
    Stopped,
}

/// Shared view of a loop's current [`ScanState`].
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<Mutex<ScanState>>);

impl StateCell {
    pub fn get(&self) -> ScanState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, state: ScanState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Everything one loop needs.  Built by the scan manager.
pub struct ScanContext {
    pub strategy: Arc<Strategy>,
    pub run_id: Uuid,
    pub config: ScanConfig,
    pub notifier: Notifier,
    pub brokers: Arc<dyn BrokerFactory>,
    pub cancel: CancelToken,
    pub state: StateCell,
}

impl ScanContext {
    fn status(&self, status: ScanStatus) -> ScanEvent {
        ScanEvent::ScanStatusUpdate(StatusPayload {
            strategy_id: self.strategy.id,
            strategy_name: self.strategy.name.clone(),
            run_id: self.run_id,
            status,
            timestamp: Utc::now(),
        })
    }

    fn notify(&self, level: Level, message: String) {
        self.notifier.publish(&ScanEvent::notification(
            level,
            message,
            Some(self.strategy.id),
        ));
    }
}

/// Publishes the final `stopped` status however the loop exits.
struct StopGuard<'a> {
    ctx: &'a ScanContext,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.ctx.state.set(ScanState::Stopped);
        self.ctx.notifier.publish(&self.ctx.status(ScanStatus::Stopped));
        info!(
            strategy_id = self.ctx.strategy.id,
            run_id = %self.ctx.run_id,
            "⏹️ Scan stopped"
        );
    }
}

// ─── Plan ─────────────────────────────────────────────────────────────────────

/// Both rule trees, compiled once per run.
struct ScanPlan {
    first: Predicate,
    second: Option<SecondScan>,
}

struct SecondScan {
    timeframes: Vec<Timeframe>,
    tree: CompiledTree,
    evaluate: bool,
    candle_columns: Vec<String>,
}

impl ScanPlan {
    fn compile(rules: &ScanRules, mode: Phase2Mode) -> Result<Self, RuleError> {
        let first = Predicate::compile(rules.first_scan.as_ref())?;
        let second = match &rules.second_scan {
            None => None,
            Some(group) => {
                let tree = CompiledTree::compile(Some(group))?;
                Some(SecondScan {
                    timeframes: extract_timeframes(group).into_iter().collect(),
                    evaluate: mode == Phase2Mode::Evaluate && !tree.is_empty(),
                    tree,
                    candle_columns: STANDARD_COLUMNS.iter().map(|c| c.to_string()).collect(),
                })
            }
        };
        Ok(Self { first, second })
    }
}

// ─── Cycle ────────────────────────────────────────────────────────────────────

enum Cycle {
    EmptySnapshot,
    Matches(Vec<MatchPayload>),
}

#[derive(Debug, thiserror::Error)]
enum CycleError {
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

async fn run_cycle(
    ctx: &ScanContext,
    client: &dyn MarketData,
    plan: &ScanPlan,
) -> Result<Cycle, CycleError> {
    let strategy = &ctx.strategy;
    let snapshot = client.fetch_snapshot(&strategy.market).await?;
    if snapshot.is_empty() {
        return Ok(Cycle::EmptySnapshot);
    }

    let phase1 = plan.first.apply(&snapshot)?;
    debug!(
        strategy_id = strategy.id,
        snapshot = snapshot.len(),
        survivors = phase1.len(),
        "phase 1 done"
    );

    let phase2 = match &plan.second {
        Some(second) if !phase1.is_empty() => {
            let confirmed = confirm(client, second, &phase1, &ctx.config).await?;
            debug!(
                strategy_id = strategy.id,
                survivors = confirmed.len(),
                "phase 2 done"
            );
            confirmed
        }
        _ => phase1,
    };

    let now = Utc::now();
    let matches = phase2
        .rows()
        .iter()
        .map(|row| MatchPayload {
            strategy_id: strategy.id,
            strategy_name: strategy.name.clone(),
            ticker: row.symbol.clone(),
            timestamp: now,
            details: MatchDetails {
                price: phase2.value(row, "close").unwrap_or(0.0),
                volume: phase2.value(row, "volume").unwrap_or(0.0),
                amount: phase2.value(row, "amount").unwrap_or(0.0),
            },
        })
        .collect();

    Ok(Cycle::Matches(matches))
}

/// Phase 2 over every survivor, at most `phase2_concurrency` at a time.
/// Output keeps the survivors' order.
async fn confirm(
    client: &dyn MarketData,
    second: &SecondScan,
    survivors: &Frame,
    config: &ScanConfig,
) -> Result<Frame, RuleError> {
    if second.timeframes.is_empty() && !second.evaluate {
        return Ok(survivors.clone());
    }

    let verdicts: Vec<Result<bool, RuleError>> = stream::iter(survivors.rows())
        .map(|row| confirm_symbol(client, second, survivors.columns(), row, config.series_count))
        .buffered(config.phase2_concurrency.max(1))
        .boxed()
        .collect()
        .await;

    let keep = verdicts.into_iter().collect::<Result<Vec<bool>, RuleError>>()?;
    let mut keep = keep.into_iter();
    Ok(survivors.filter(|_| keep.next().unwrap_or(false)))
}

async fn confirm_symbol(
    client: &dyn MarketData,
    second: &SecondScan,
    columns: &[String],
    row: &Row,
    count: usize,
) -> Result<bool, RuleError> {
    let symbol = row.symbol.as_str();
    let fetched = join_all(
        second
            .timeframes
            .iter()
            .map(|tf| client.fetch_series(symbol, *tf, count)),
    )
    .await;

    let mut latest: Vec<(Timeframe, Vec<f64>)> = Vec::with_capacity(fetched.len());
    for (tf, result) in second.timeframes.iter().zip(fetched) {
        match result {
            Ok(series) => match series.latest() {
                Some(candle) => latest.push((*tf, candle.values())),
                None => {
                    debug!(symbol, timeframe = %tf, "no candles, rejected in phase 2");
                    return Ok(false);
                }
            },
            Err(e) => {
                warn!(symbol, timeframe = %tf, error = %e, "series fetch failed, rejected in phase 2");
                return Ok(false);
            }
        }
    }

    if !second.evaluate {
        return Ok(true);
    }

    second.tree.evaluate(|tf| match tf {
        None => Some(RowView {
            columns,
            values: &row.values,
        }),
        Some(tf) => latest
            .iter()
            .find(|(t, _)| *t == tf)
            .map(|(_, values)| RowView {
                columns: &second.candle_columns,
                values,
            }),
    })
}

// ─── Loop ─────────────────────────────────────────────────────────────────────

/// Runs the loop until cancelled or a rule error stops it.
pub async fn run_scan(ctx: ScanContext) {
    let _guard = StopGuard { ctx: &ctx };
    let strategy = &ctx.strategy;

    ctx.state.set(ScanState::Starting);
    ctx.notifier.publish(&ctx.status(ScanStatus::Running));
    info!(
        strategy_id = strategy.id,
        strategy = %strategy.name,
        run_id = %ctx.run_id,
        broker = %strategy.broker,
        market = %strategy.market,
        "🔎 Scan started"
    );

    let client = match ctx.brokers.connect(&strategy.broker) {
        Ok(client) => client,
        Err(e) => {
            error!(strategy_id = strategy.id, error = %e, "Scan cannot start");
            ctx.notify(Level::Error, format!("Scan '{}' cannot start: {e}", strategy.name));
            return;
        }
    };

    let plan = match ScanPlan::compile(&strategy.scan_rules, ctx.config.phase2_mode) {
        Ok(plan) => plan,
        Err(e) => {
            error!(strategy_id = strategy.id, error = %e, "Invalid rule, scan stopped");
            ctx.notify(Level::Error, format!("Scan '{}' stopped: {e}", strategy.name));
            return;
        }
    };
    debug!(strategy_id = strategy.id, broker = client.name(), "market data connected");
    match plan.first.expression() {
        Some(expression) => debug!(strategy_id = strategy.id, %expression, "first_scan compiled"),
        None => debug!(strategy_id = strategy.id, "first_scan empty, every symbol passes phase 1"),
    }

    ctx.state.set(ScanState::Running);
    let mut empty_streak = 0u32;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            outcome = run_cycle(&ctx, client.as_ref(), &plan) => outcome,
        };

        if outcome.is_ok() && ctx.state.get() == ScanState::Errored {
            info!(strategy_id = strategy.id, "Scan recovered");
            ctx.notify(Level::Info, format!("Scan '{}' recovered", strategy.name));
        }

        let pause = match outcome {
            Ok(Cycle::EmptySnapshot) => {
                ctx.state.set(ScanState::Running);
                empty_streak += 1;
                warn!(
                    strategy_id = strategy.id,
                    market = %strategy.market,
                    empty_streak,
                    "Empty snapshot, retrying"
                );
                if empty_streak == 1 {
                    ctx.notify(
                        Level::Warning,
                        format!(
                            "Scan '{}': market '{}' returned no symbols, retrying",
                            strategy.name, strategy.market
                        ),
                    );
                }
                ctx.config.empty_snapshot_retry
            }
            Ok(Cycle::Matches(matches)) => {
                ctx.state.set(ScanState::Running);
                empty_streak = 0;
                if !matches.is_empty() {
                    info!(strategy_id = strategy.id, matches = matches.len(), "🎯 Cycle matched");
                }
                for found in matches {
                    ctx.notifier.publish(&ScanEvent::ScanResultFound(found));
                }
                ctx.config.scan_interval
            }
            Err(CycleError::Rule(e)) => {
                error!(strategy_id = strategy.id, error = %e, "Invalid rule, scan stopped");
                ctx.notify(Level::Error, format!("Scan '{}' stopped: {e}", strategy.name));
                return;
            }
            Err(CycleError::Broker(e)) => {
                ctx.state.set(ScanState::Errored);
                warn!(strategy_id = strategy.id, error = %e, "Cycle failed, backing off");
                ctx.notify(Level::Error, format!("Scan '{}' cycle failed: {e}", strategy.name));
                ctx.config.error_backoff
            }
        };

        if !ctx.cancel.pause(pause).await {
            break;
        }
    }

    ctx.state.set(ScanState::Stopping);
    debug!(strategy_id = strategy.id, "cancellation observed");
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{StaticBroker, StaticBrokers};
    use crate::models::{Candle, Group, Node, Series};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn fast_config() -> ScanConfig {
        ScanConfig {
            scan_interval: Duration::from_millis(20),
            empty_snapshot_retry: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
            ..ScanConfig::default()
        }
    }

    fn market() -> Frame {
        Frame::standard()
            .with_row("KRW-BTC", vec![5900.0, 6100.0, 5800.0, 6000.0, 5.0, 30000.0])
            .with_row("KRW-ETH", vec![410.0, 420.0, 390.0, 400.0, 50.0, 20000.0])
    }

    fn candle(open: f64, close: f64) -> Candle {
        Candle {
            time: Utc::now(),
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1.0,
            amount: close,
        }
    }

    fn series(symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) -> Series {
        Series {
            symbol: symbol.to_string(),
            timeframe,
            candles,
        }
    }

    struct Harness {
        ctx: ScanContext,
        rx: broadcast::Receiver<String>,
    }

    fn harness(broker: Arc<StaticBroker>, rules: ScanRules, config: ScanConfig) -> Harness {
        let notifier = Notifier::new(64);
        let rx = notifier.subscribe();
        let ctx = ScanContext {
            strategy: Arc::new(Strategy::fixture(1, "alpha", "static", rules)),
            run_id: Uuid::new_v4(),
            config,
            notifier,
            brokers: Arc::new(StaticBrokers(broker)),
            cancel: CancelToken::new(),
            state: StateCell::default(),
        };
        Harness { ctx, rx }
    }

    async fn next_event(rx: &mut broadcast::Receiver<String>) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        serde_json::from_str(&text).unwrap()
    }

    async fn wait_for(rx: &mut broadcast::Receiver<String>, name: &str) -> Value {
        loop {
            let event = next_event(rx).await;
            if event["event"] == name {
                return event;
            }
        }
    }

    fn drain(rx: &mut broadcast::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition within deadline");
    }

    fn first_only(group: Group) -> ScanRules {
        ScanRules {
            first_scan: Some(group),
            second_scan: None,
        }
    }

    #[tokio::test]
    async fn phase1_matches_are_published_in_order() {
        let broker = Arc::new(StaticBroker::new().snapshot(market()));
        let Harness { ctx, mut rx } = harness(
            broker,
            first_only(Group::or(vec![
                Node::condition("close > 1000"),
                Node::condition("volume > 10"),
            ])),
            fast_config(),
        );
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run_scan(ctx));

        let running = next_event(&mut rx).await;
        assert_eq!(running["event"], "scan_status_update");
        assert_eq!(running["payload"]["status"], "running");

        let first = wait_for(&mut rx, "scan_result_found").await;
        let second = wait_for(&mut rx, "scan_result_found").await;
        assert_eq!(first["payload"]["ticker"], "KRW-BTC");
        assert_eq!(first["payload"]["details"]["price"], 6000.0);
        assert_eq!(second["payload"]["ticker"], "KRW-ETH");

        cancel.cancel();
        task.await.unwrap();
        let tail = drain(&mut rx);
        let last = tail.last().expect("stopped status");
        assert_eq!(last["payload"]["status"], "stopped");
    }

    #[tokio::test]
    async fn phase2_rejects_symbols_without_series() {
        let broker = Arc::new(StaticBroker::new().snapshot(market()));
        let rules = ScanRules {
            first_scan: Some(Group::and(vec![Node::condition("close > 1000")])),
            second_scan: Some(Group::and(vec![Node::condition_on(
                Timeframe::Minute5,
                "close > open",
            )])),
        };
        let Harness { ctx, mut rx } = harness(broker.clone(), rules, fast_config());
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run_scan(ctx));

        wait_until(|| broker.snapshot_calls() >= 2).await;
        cancel.cancel();
        task.await.unwrap();

        let events = drain(&mut rx);
        assert!(events.iter().all(|e| e["event"] != "scan_result_found"));
        assert!(broker.series_calls() >= 1);
    }

    #[tokio::test]
    async fn phase2_passes_symbols_with_data() {
        let broker = Arc::new(
            StaticBroker::new()
                .snapshot(market())
                .series(series("KRW-BTC", Timeframe::Minute5, vec![candle(1.0, 2.0)])),
        );
        let rules = ScanRules {
            first_scan: Some(Group::and(vec![Node::condition("close > 1000")])),
            second_scan: Some(Group::and(vec![Node::condition_on(
                Timeframe::Minute5,
                "close < open",
            )])),
        };
        let Harness { ctx, mut rx } = harness(broker, rules, fast_config());
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run_scan(ctx));

        // Availability mode: data presence confirms, the condition itself is not evaluated.
        let found = wait_for(&mut rx, "scan_result_found").await;
        assert_eq!(found["payload"]["ticker"], "KRW-BTC");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn evaluate_mode_checks_latest_candles() {
        let broker = Arc::new(
            StaticBroker::new()
                .snapshot(market())
                .series(series("KRW-BTC", Timeframe::Day, vec![candle(1.0, 2.0)]))
                .series(series("KRW-ETH", Timeframe::Day, vec![candle(2.0, 1.0)])),
        );
        let rules = ScanRules {
            first_scan: None,
            second_scan: Some(Group::and(vec![
                Node::condition_on(Timeframe::Day, "close > open"),
                Node::condition("volume > 1"),
            ])),
        };
        let config = ScanConfig {
            phase2_mode: Phase2Mode::Evaluate,
            ..fast_config()
        };
        let Harness { ctx, mut rx } = harness(broker.clone(), rules, config);
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run_scan(ctx));

        let found = wait_for(&mut rx, "scan_result_found").await;
        assert_eq!(found["payload"]["ticker"], "KRW-BTC");
        wait_until(|| broker.snapshot_calls() >= 2).await;

        cancel.cancel();
        task.await.unwrap();
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .filter(|e| e["event"] == "scan_result_found")
            .all(|e| e["payload"]["ticker"] == "KRW-BTC"));
    }

    #[tokio::test]
    async fn forbidden_rule_stops_before_fetching() {
        let broker = Arc::new(StaticBroker::new().snapshot(market()));
        let Harness { ctx, mut rx } = harness(
            broker.clone(),
            first_only(Group::and(vec![Node::condition("__import__('os')")])),
            fast_config(),
        );
        let state = ctx.state.clone();

        run_scan(ctx).await;

        let events = drain(&mut rx);
        let names: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["scan_status_update", "notification", "scan_status_update"]);
        assert_eq!(events[1]["payload"]["level"], "error");
        assert_eq!(events[2]["payload"]["status"], "stopped");
        assert_eq!(broker.snapshot_calls(), 0);
        assert_eq!(state.get(), ScanState::Stopped);
    }

    #[tokio::test]
    async fn unknown_column_is_fatal_at_first_cycle() {
        let broker = Arc::new(StaticBroker::new().snapshot(market()));
        let Harness { ctx, mut rx } = harness(
            broker.clone(),
            first_only(Group::and(vec![Node::condition("rsi < 30")])),
            fast_config(),
        );

        run_scan(ctx).await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e["event"] == "notification"));
        assert!(events.iter().all(|e| e["event"] != "scan_result_found"));
        assert_eq!(broker.snapshot_calls(), 1);
    }

    #[tokio::test]
    async fn empty_snapshot_is_retried() {
        let broker = Arc::new(
            StaticBroker::new()
                .snapshot(Frame::standard())
                .snapshot(market()),
        );
        let Harness { ctx, mut rx } = harness(
            broker.clone(),
            first_only(Group::and(vec![Node::condition("close > 1000")])),
            fast_config(),
        );
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run_scan(ctx));

        let warning = wait_for(&mut rx, "notification").await;
        assert_eq!(warning["payload"]["level"], "warning");
        assert!(warning["payload"]["message"].as_str().unwrap().contains("KRW"));
        let found = wait_for(&mut rx, "scan_result_found").await;
        assert_eq!(found["payload"]["ticker"], "KRW-BTC");
        assert!(broker.snapshot_calls() >= 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn transport_errors_back_off_and_continue() {
        let broker = Arc::new(
            StaticBroker::new()
                .failing_snapshot("connection reset")
                .snapshot(market()),
        );
        let Harness { ctx, mut rx } = harness(
            broker,
            first_only(Group::and(vec![Node::condition("close > 1000")])),
            fast_config(),
        );
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run_scan(ctx));

        let note = wait_for(&mut rx, "notification").await;
        assert_eq!(note["payload"]["level"], "error");
        assert_eq!(note["payload"]["strategy_id"], 1);
        let recovered = wait_for(&mut rx, "notification").await;
        assert_eq!(recovered["payload"]["level"], "info");
        let found = wait_for(&mut rx, "scan_result_found").await;
        assert_eq!(found["payload"]["ticker"], "KRW-BTC");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_broker_reports_and_stops() {
        let broker = Arc::new(StaticBroker::new());
        let Harness { mut ctx, mut rx } = harness(broker, ScanRules::default(), fast_config());
        ctx.strategy = Arc::new(Strategy::fixture(9, "beta", "nowhere", ScanRules::default()));

        run_scan(ctx).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events[1]["payload"]["message"]
            .as_str()
            .unwrap()
            .contains("nowhere"));
        assert_eq!(events[2]["payload"]["status"], "stopped");
    }

    #[tokio::test]
    async fn cancel_during_sleep_stops_promptly() {
        let broker = Arc::new(StaticBroker::new().snapshot(market()));
        let config = ScanConfig {
            scan_interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let Harness { ctx, mut rx } = harness(broker, ScanRules::default(), config);
        let cancel = ctx.cancel.clone();
        let state = ctx.state.clone();
        let task = tokio::spawn(run_scan(ctx));

        wait_for(&mut rx, "scan_result_found").await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop exits without waiting out the interval")
            .unwrap();

        assert_eq!(state.get(), ScanState::Stopped);
        let stopped = wait_for(&mut rx, "scan_status_update").await;
        assert_eq!(stopped["payload"]["status"], "stopped");
    }

    #[tokio::test]
    async fn cancel_abandons_a_hung_snapshot_fetch() {
        let broker = Arc::new(StaticBroker::new().snapshot(market()).stall_snapshot());
        let Harness { ctx, mut rx } = harness(broker.clone(), ScanRules::default(), fast_config());
        let cancel = ctx.cancel.clone();
        let state = ctx.state.clone();
        let task = tokio::spawn(run_scan(ctx));

        wait_until(|| broker.snapshot_calls() >= 1).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop exits while the snapshot fetch hangs")
            .unwrap();

        assert_eq!(state.get(), ScanState::Stopped);
        let events = drain(&mut rx);
        assert!(events.iter().all(|e| e["event"] != "scan_result_found"));
        assert_eq!(events.last().unwrap()["payload"]["status"], "stopped");
    }

    #[tokio::test]
    async fn cancel_abandons_hung_series_fetches() {
        let broker = Arc::new(StaticBroker::new().snapshot(market()).stall_series());
        let rules = ScanRules {
            first_scan: None,
            second_scan: Some(Group::and(vec![Node::condition_on(
                Timeframe::Minute5,
                "close > open",
            )])),
        };
        let Harness { ctx, mut rx } = harness(broker.clone(), rules, fast_config());
        let cancel = ctx.cancel.clone();
        let state = ctx.state.clone();
        let task = tokio::spawn(run_scan(ctx));

        wait_until(|| broker.series_calls() >= 1).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop exits while phase 2 hangs")
            .unwrap();

        assert_eq!(state.get(), ScanState::Stopped);
        assert_eq!(broker.snapshot_calls(), 1);
        let events = drain(&mut rx);
        assert!(events.iter().all(|e| e["event"] != "scan_result_found"));
        assert_eq!(events.last().unwrap()["payload"]["status"], "stopped");
    }

    #[tokio::test]
    async fn phase2_results_keep_snapshot_order() {
        let symbols = ["KRW-BTC", "KRW-ETH", "KRW-XRP", "KRW-SOL"];
        for concurrency in [1, 2, 4] {
            let snapshot = symbols.iter().fold(Frame::standard(), |frame, symbol| {
                frame.with_row(*symbol, vec![1.0, 2.0, 0.5, 1.5, 10.0, 15.0])
            });
            // Earlier symbols answer later.
            let broker = symbols.iter().enumerate().fold(
                StaticBroker::new().snapshot(snapshot),
                |broker, (i, symbol)| {
                    let delay = Duration::from_millis(10 * (symbols.len() - i) as u64);
                    broker
                        .series(series(symbol, Timeframe::Minute5, vec![candle(1.0, 2.0)]))
                        .series_delay(symbol, delay)
                },
            );
            let rules = ScanRules {
                first_scan: None,
                second_scan: Some(Group::and(vec![Node::condition_on(
                    Timeframe::Minute5,
                    "close > open",
                )])),
            };
            let config = ScanConfig {
                phase2_concurrency: concurrency,
                scan_interval: Duration::from_secs(3600),
                ..fast_config()
            };
            let Harness { ctx, mut rx } = harness(Arc::new(broker), rules, config);
            let cancel = ctx.cancel.clone();
            let task = tokio::spawn(run_scan(ctx));

            let mut tickers = Vec::new();
            for _ in 0..symbols.len() {
                let found = wait_for(&mut rx, "scan_result_found").await;
                tickers.push(found["payload"]["ticker"].as_str().unwrap().to_string());
            }
            assert_eq!(tickers, symbols, "phase2_concurrency = {concurrency}");

            cancel.cancel();
            task.await.unwrap();
        }
    }
}
