//! # broker
//!
//! Market-data adapters.  Every adapter normalizes its venue's payloads into a
//! [`Frame`] (one row per symbol, standard columns) or a [`Series`] of candles,
//! so the scan engine never sees venue-specific field names.
//!
//! | id      | Adapter                 |
//! |---------|-------------------------|
//! | `upbit` | [`upbit::UpbitClient`]  |
//! | `mock`  | [`mock::MockBroker`]    |

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::UpbitConfig;
use crate::models::{Frame, Series, Timeframe};

pub mod mock;
pub mod upbit;

#[cfg(test)]
pub mod testing;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unsupported broker '{0}'")]
    Unsupported(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Read-only access to one venue's market data.
///
/// Benign absence (unknown market, no candles yet) is an empty result, not an
/// error.  Errors mean the venue could not be asked.
#[async_trait]
pub trait MarketData: Send + Sync {
    fn name(&self) -> &str;

    /// Current reading of every symbol in `market`.
    async fn fetch_snapshot(&self, market: &str) -> Result<Frame, BrokerError>;

    /// Up to `count` most recent candles of `symbol`, oldest first.
    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Series, BrokerError>;
}

/// Resolves a strategy's broker id to a client.
pub trait BrokerFactory: Send + Sync {
    fn connect(&self, broker: &str) -> Result<Arc<dyn MarketData>, BrokerError>;

    fn supports(&self, broker: &str) -> bool {
        self.connect(broker).is_ok()
    }
}

/// The adapters this binary ships with.  Clients are shared between scans so
/// the Upbit rate limit applies process-wide.
pub struct DefaultBrokers {
    upbit: Arc<upbit::UpbitClient>,
    mock: Arc<mock::MockBroker>,
}

impl DefaultBrokers {
    pub fn new(upbit: &UpbitConfig) -> Self {
        Self {
            upbit: Arc::new(upbit::UpbitClient::new(upbit)),
            mock: Arc::new(mock::MockBroker::default()),
        }
    }
}

impl BrokerFactory for DefaultBrokers {
    fn connect(&self, broker: &str) -> Result<Arc<dyn MarketData>, BrokerError> {
        match broker.trim().to_ascii_lowercase().as_str() {
            "upbit" => Ok(self.upbit.clone()),
            "mock" => Ok(self.mock.clone()),
            _ => Err(BrokerError::Unsupported(broker.to_string())),
        }
    }
}
