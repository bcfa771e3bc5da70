//! Scripted market data for engine and route tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{BrokerError, BrokerFactory, MarketData};
use crate::models::{Frame, Series, Timeframe};

/// Returns scripted snapshots in order (the last one repeats) and a fixed
/// series per `(symbol, timeframe)`; unknown pairs get an empty series.
/// Either fetch can be made to hang forever, and series replies can be
/// delayed per symbol.
#[derive(Default)]
pub struct StaticBroker {
    snapshots: Mutex<VecDeque<Result<Frame, String>>>,
    series: HashMap<(String, Timeframe), Series>,
    series_delay: HashMap<String, Duration>,
    stall_snapshot: bool,
    stall_series: bool,
    snapshot_calls: AtomicUsize,
    series_calls: AtomicUsize,
}

impl StaticBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(self, frame: Frame) -> Self {
        self.push(Ok(frame))
    }

    /// Scripts a transport failure.
    pub fn failing_snapshot(self, message: &str) -> Self {
        self.push(Err(message.to_string()))
    }

    pub fn series(mut self, series: Series) -> Self {
        self.series
            .insert((series.symbol.clone(), series.timeframe), series);
        self
    }

    /// Delays every series reply for `symbol`.
    pub fn series_delay(mut self, symbol: &str, delay: Duration) -> Self {
        self.series_delay.insert(symbol.to_string(), delay);
        self
    }

    /// Snapshot fetches never complete.
    pub fn stall_snapshot(mut self) -> Self {
        self.stall_snapshot = true;
        self
    }

    /// Series fetches never complete.
    pub fn stall_series(mut self) -> Self {
        self.stall_series = true;
        self
    }

    fn push(self, entry: Result<Frame, String>) -> Self {
        if let Ok(mut queue) = self.snapshots.lock() {
            queue.push_back(entry);
        }
        self
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn series_calls(&self) -> usize {
        self.series_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketData for StaticBroker {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_snapshot(&self, _market: &str) -> Result<Frame, BrokerError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_snapshot {
            std::future::pending::<()>().await;
        }
        let mut queue = self.snapshots.lock().unwrap();
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match next {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(message)) => Err(BrokerError::Decode(message)),
            None => Ok(Frame::standard()),
        }
    }

    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        _count: usize,
    ) -> Result<Series, BrokerError> {
        self.series_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_series {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.series_delay.get(symbol) {
            tokio::time::sleep(*delay).await;
        }
        Ok(self
            .series
            .get(&(symbol.to_string(), timeframe))
            .cloned()
            .unwrap_or_else(|| Series::empty(symbol, timeframe)))
    }
}

/// Serves one [`StaticBroker`] under the id `"static"`.
pub struct StaticBrokers(pub Arc<StaticBroker>);

impl BrokerFactory for StaticBrokers {
    fn connect(&self, broker: &str) -> Result<Arc<dyn MarketData>, BrokerError> {
        if broker == "static" {
            Ok(self.0.clone())
        } else {
            Err(BrokerError::Unsupported(broker.to_string()))
        }
    }
}
