//! # broker::upbit
//!
//! Upbit public REST adapter.
//!
//! | Call                | Endpoint                                   |
//! |---------------------|--------------------------------------------|
//! | `fetch_snapshot`    | `/v1/market/all` then `/v1/ticker` batches |
//! | `fetch_series`      | `/v1/candles/{minutes/N,days,weeks,months}`|
//!
//! Field mapping: `opening_price→open`, `high_price→high`, `low_price→low`,
//! `trade_price→close`, `acc_trade_volume→volume`, `acc_trade_price→amount`.
//! Missing numeric fields become `0`.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

use super::{BrokerError, MarketData};
use crate::config::UpbitConfig;
use crate::models::{Candle, Frame, Series, Timeframe};

/// `/v1/ticker` accepts this many markets per request.
const TICKER_BATCH: usize = 100;
/// `/v1/candles/*` returns at most this many candles.
const MAX_CANDLES: usize = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Wire Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MarketInfo {
    market: String,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    market: String,
    #[serde(default)]
    opening_price: Option<f64>,
    #[serde(default)]
    high_price: Option<f64>,
    #[serde(default)]
    low_price: Option<f64>,
    #[serde(default)]
    trade_price: Option<f64>,
    #[serde(default)]
    acc_trade_volume: Option<f64>,
    #[serde(default)]
    acc_trade_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    candle_date_time_utc: String,
    #[serde(default)]
    opening_price: Option<f64>,
    #[serde(default)]
    high_price: Option<f64>,
    #[serde(default)]
    low_price: Option<f64>,
    #[serde(default)]
    trade_price: Option<f64>,
    #[serde(default)]
    candle_acc_trade_volume: Option<f64>,
    #[serde(default)]
    candle_acc_trade_price: Option<f64>,
}

// ─── Client ───────────────────────────────────────────────────────────────────

pub struct UpbitClient {
    http: reqwest::Client,
    base_url: String,
    limiter: DefaultDirectRateLimiter,
}

impl UpbitClient {
    pub fn new(config: &UpbitConfig) -> Self {
        let per_sec = NonZeroU32::new(config.requests_per_sec).unwrap_or(NonZeroU32::MIN);
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::direct(Quota::per_second(per_sec)),
        }
    }

    /// GET `path` and decode the body.  `Ok(None)` on HTTP 404.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, BrokerError> {
        self.limiter.until_ready().await;

        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, url = %url, "Upbit unreachable");
                BrokerError::Transport(e)
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(http_status = %status, body = %body, "Upbit returned HTTP error");
            return Err(BrokerError::Status {
                service: "upbit",
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| BrokerError::Decode(format!("upbit {path}: {e}")))
    }
}

#[async_trait]
impl MarketData for UpbitClient {
    fn name(&self) -> &str {
        "upbit"
    }

    async fn fetch_snapshot(&self, market: &str) -> Result<Frame, BrokerError> {
        let prefix = format!("{}-", quote_currency(market));
        let listed: Vec<MarketInfo> = self
            .get_json("/v1/market/all", &[])
            .await?
            .unwrap_or_default();

        let symbols: Vec<String> = listed
            .into_iter()
            .map(|m| m.market)
            .filter(|m| m.starts_with(&prefix))
            .collect();
        if symbols.is_empty() {
            debug!(market, "no listed symbols");
            return Ok(Frame::standard());
        }

        let mut tickers = Vec::with_capacity(symbols.len());
        for batch in symbols.chunks(TICKER_BATCH) {
            let page: Vec<Ticker> = self
                .get_json("/v1/ticker", &[("markets", batch.join(","))])
                .await?
                .unwrap_or_default();
            tickers.extend(page);
        }

        debug!(market, symbols = tickers.len(), "snapshot fetched");
        Ok(ticker_frame(tickers))
    }

    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Series, BrokerError> {
        let count = count.clamp(1, MAX_CANDLES);
        let raw: Vec<RawCandle> = self
            .get_json(
                &candle_path(timeframe),
                &[("market", symbol.to_string()), ("count", count.to_string())],
            )
            .await?
            .unwrap_or_default();

        series_from(symbol, timeframe, raw)
    }
}

// ─── Conversions ──────────────────────────────────────────────────────────────

/// `"KRW"` and `"krw-btc"` both select the KRW market.
fn quote_currency(market: &str) -> String {
    market
        .split('-')
        .next()
        .unwrap_or(market)
        .trim()
        .to_ascii_uppercase()
}

fn candle_path(timeframe: Timeframe) -> String {
    match timeframe.minutes() {
        Some(unit) => format!("/v1/candles/minutes/{unit}"),
        None => match timeframe {
            Timeframe::Week => "/v1/candles/weeks".to_string(),
            Timeframe::Month => "/v1/candles/months".to_string(),
            _ => "/v1/candles/days".to_string(),
        },
    }
}

fn ticker_frame(tickers: Vec<Ticker>) -> Frame {
    tickers.into_iter().fold(Frame::standard(), |frame, t| {
        let values = [
            t.opening_price,
            t.high_price,
            t.low_price,
            t.trade_price,
            t.acc_trade_volume,
            t.acc_trade_price,
        ]
        .map(|v| v.unwrap_or(0.0))
        .to_vec();
        frame.with_row(t.market, values)
    })
}

/// Upbit lists candles newest first; the series is oldest first.
fn series_from(
    symbol: &str,
    timeframe: Timeframe,
    raw: Vec<RawCandle>,
) -> Result<Series, BrokerError> {
    let mut candles = raw
        .into_iter()
        .map(|c| {
            let time = NaiveDateTime::parse_from_str(&c.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
                .map_err(|e| {
                    BrokerError::Decode(format!(
                        "candle time '{}': {e}",
                        c.candle_date_time_utc
                    ))
                })?
                .and_utc();
            Ok(Candle {
                time,
                open: c.opening_price.unwrap_or(0.0),
                high: c.high_price.unwrap_or(0.0),
                low: c.low_price.unwrap_or(0.0),
                close: c.trade_price.unwrap_or(0.0),
                volume: c.candle_acc_trade_volume.unwrap_or(0.0),
                amount: c.candle_acc_trade_price.unwrap_or(0.0),
            })
        })
        .collect::<Result<Vec<_>, BrokerError>>()?;
    candles.reverse();

    Ok(Series {
        symbol: symbol.to_string(),
        timeframe,
        candles,
    })
}
