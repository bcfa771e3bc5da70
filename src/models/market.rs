//! # models::market
//!
//! The normalized market-data contract every broker adapter produces.
//!
//! * [`Frame`]  — one row per symbol, columns named after the standard fields
//!   (`open`, `high`, `low`, `close`, `volume`, `amount`).  Phase 1 scans run
//!   against a snapshot frame.
//! * [`Series`] — time-indexed candles for one symbol at one [`Timeframe`].
//!   Phase 2 fetches these for phase-1 survivors.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Column names every adapter must provide, in this order.
pub const STANDARD_COLUMNS: [&str; 6] = ["open", "high", "low", "close", "volume", "amount"];

// ─── Timeframe ────────────────────────────────────────────────────────────────

/// A historical-data resolution a rule condition can be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "minute1")]
    Minute1,
    #[serde(rename = "minute3")]
    Minute3,
    #[serde(rename = "minute5")]
    Minute5,
    #[serde(rename = "minute10")]
    Minute10,
    #[serde(rename = "minute15")]
    Minute15,
    #[serde(rename = "minute30")]
    Minute30,
    #[serde(rename = "minute60")]
    Minute60,
    #[serde(rename = "minute240")]
    Minute240,
    #[serde(rename = "day")]
    Day,
    #[serde(rename = "week")]
    Week,
    #[serde(rename = "month")]
    Month,
}

impl Timeframe {
    pub const ALL: [Timeframe; 11] = [
        Timeframe::Minute1,
        Timeframe::Minute3,
        Timeframe::Minute5,
        Timeframe::Minute10,
        Timeframe::Minute15,
        Timeframe::Minute30,
        Timeframe::Minute60,
        Timeframe::Minute240,
        Timeframe::Day,
        Timeframe::Week,
        Timeframe::Month,
    ];

    /// Wire identifier, e.g. `"minute5"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "minute1",
            Timeframe::Minute3 => "minute3",
            Timeframe::Minute5 => "minute5",
            Timeframe::Minute10 => "minute10",
            Timeframe::Minute15 => "minute15",
            Timeframe::Minute30 => "minute30",
            Timeframe::Minute60 => "minute60",
            Timeframe::Minute240 => "minute240",
            Timeframe::Day => "day",
            Timeframe::Week => "week",
            Timeframe::Month => "month",
        }
    }

    /// Candle width in minutes for intraday resolutions, `None` otherwise.
    pub fn minutes(&self) -> Option<u32> {
        match self {
            Timeframe::Minute1 => Some(1),
            Timeframe::Minute3 => Some(3),
            Timeframe::Minute5 => Some(5),
            Timeframe::Minute10 => Some(10),
            Timeframe::Minute15 => Some(15),
            Timeframe::Minute30 => Some(30),
            Timeframe::Minute60 => Some(60),
            Timeframe::Minute240 => Some(240),
            Timeframe::Day | Timeframe::Week | Timeframe::Month => None,
        }
    }

    /// Approximate candle width (a month counts as 30 days).
    pub fn duration(&self) -> Duration {
        match self.minutes() {
            Some(m) => Duration::minutes(i64::from(m)),
            None => match self {
                Timeframe::Day => Duration::days(1),
                Timeframe::Week => Duration::weeks(1),
                _ => Duration::days(30),
            },
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown timeframe '{0}'")]
pub struct UnknownTimeframe(pub String);

impl FromStr for Timeframe {
    type Err = UnknownTimeframe;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownTimeframe(s.to_string()))
    }
}

// ─── Frame ────────────────────────────────────────────────────────────────────

/// One symbol's values, aligned with the owning frame's columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub symbol: String,
    pub values: Vec<f64>,
}

/// A row-oriented table keyed by symbol.
///
/// Row order is the adapter's order and is preserved by every filter.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Frame {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// An empty frame with [`STANDARD_COLUMNS`].
    pub fn standard() -> Self {
        Self::new(STANDARD_COLUMNS)
    }

    /// Appends a row.  Missing trailing values are filled with `0.0` and extra
    /// values are dropped so the row always matches the column count.
    pub fn push(&mut self, symbol: impl Into<String>, mut values: Vec<f64>) {
        values.resize(self.columns.len(), 0.0);
        self.rows.push(Row {
            symbol: symbol.into(),
            values,
        });
    }

    /// Builder form of [`Frame::push`].
    pub fn with_row(mut self, symbol: impl Into<String>, values: Vec<f64>) -> Self {
        self.push(symbol, values);
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Reads `column` from `row`, `None` when the frame has no such column.
    pub fn value(&self, row: &Row, column: &str) -> Option<f64> {
        self.column_index(column)
            .and_then(|idx| row.values.get(idx).copied())
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.symbol.as_str())
    }

    #[cfg(test)]
    pub fn row(&self, symbol: &str) -> Option<&Row> {
        self.rows.iter().find(|r| r.symbol == symbol)
    }

    /// A new frame with the same columns holding only the rows `keep` accepts.
    pub fn filter(&self, mut keep: impl FnMut(&Row) -> bool) -> Frame {
        Frame {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }
}

// ─── Candles ──────────────────────────────────────────────────────────────────

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub amount: f64,
}

impl Candle {
    /// Values in [`STANDARD_COLUMNS`] order.
    pub fn values(&self) -> Vec<f64> {
        vec![self.open, self.high, self.low, self.close, self.volume, self.amount]
    }
}

/// Candles for one symbol at one resolution, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
}

impl Series {
    pub fn empty(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            candles: Vec::new(),
        }
    }

    /// Most recent candle.
    pub fn latest(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

#[cfg(test)]
impl Series {
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
