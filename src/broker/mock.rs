//! # broker::mock
//!
//! In-process market data for development without network access.  Prices
//! move along a fixed saw-tooth, so consecutive snapshots differ but every
//! run of the server sees the same sequence.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DurationRound, Utc};

use super::{BrokerError, MarketData};
use crate::models::{Candle, Frame, Series, Timeframe};

/// `(symbol, base price, base volume)`
const UNIVERSE: &[(&str, f64, f64)] = &[
    ("KRW-BTC", 95_000_000.0, 1_200.0),
    ("KRW-ETH", 4_800_000.0, 9_500.0),
    ("KRW-XRP", 850.0, 210_000_000.0),
    ("KRW-SOL", 210_000.0, 180_000.0),
    ("KRW-DOGE", 230.0, 900_000_000.0),
];

/// Most candles one series request returns, like Upbit's page size.
const MAX_CANDLES: usize = 200;

#[derive(Debug, Default)]
pub struct MockBroker {
    tick: AtomicU64,
}

/// -3% .. +3% in 1% steps.
fn drift(step: u64) -> f64 {
    1.0 + ((step % 7) as f64 - 3.0) / 100.0
}

impl MockBroker {
    fn quote(&self, step: u64, base_price: f64, base_volume: f64) -> [f64; 6] {
        let close = base_price * drift(step);
        let open = base_price * drift(step + 3);
        let volume = base_volume * drift(step + 5);
        [
            open,
            open.max(close) * 1.01,
            open.min(close) * 0.99,
            close,
            volume,
            volume * close,
        ]
    }
}

#[async_trait]
impl MarketData for MockBroker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_snapshot(&self, market: &str) -> Result<Frame, BrokerError> {
        let step = self.tick.fetch_add(1, Ordering::Relaxed);
        let prefix = format!("{}-", market.split('-').next().unwrap_or(market).to_ascii_uppercase());

        Ok(UNIVERSE
            .iter()
            .enumerate()
            .filter(|(_, (symbol, _, _))| symbol.starts_with(&prefix))
            .fold(Frame::standard(), |frame, (i, (symbol, price, volume))| {
                let values = self.quote(step + i as u64, *price, *volume).to_vec();
                frame.with_row(*symbol, values)
            }))
    }

    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Series, BrokerError> {
        let Some((_, base_price, base_volume)) = UNIVERSE.iter().find(|(s, _, _)| *s == symbol) else {
            return Ok(Series::empty(symbol, timeframe));
        };

        let width = timeframe.duration();
        let now = Utc::now();
        let last = now.duration_trunc(width).unwrap_or(now);

        let count = count.min(MAX_CANDLES);
        let candles = (0..count)
            .map(|i| {
                let step = u64::try_from(i).unwrap_or_default();
                let [open, high, low, close, volume, amount] = self.quote(step, *base_price, *base_volume);
                let back = i32::try_from(count - 1 - i).unwrap_or_default();
                Candle {
                    time: last - width * back,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    amount,
                }
            })
            .collect();

        Ok(Series {
            symbol: symbol.to_string(),
            timeframe,
            candles,
        })
    }
}
