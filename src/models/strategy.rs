//! # models::strategy
//!
//! Defines [`Strategy`], a user's scan definition: which broker and market to
//! watch, the two-phase [`ScanRules`], and when the scheduler should start it.
//!
//! The scan engine receives a strategy as an `Arc<Strategy>` snapshot and never
//! mutates it; an edited strategy only takes effect when its scan restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::models::rule::{self, Group};

// ─── ScanRules ────────────────────────────────────────────────────────────────

/// The two rule trees of a strategy.
///
/// * `first_scan`  — evaluated against the whole market snapshot.
/// * `second_scan` — confirms phase-1 survivors using historical series.
///
/// Keys the engine does not know about are ignored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanRules {
    #[serde(default, with = "rule::root", skip_serializing_if = "Option::is_none")]
    pub first_scan: Option<Group>,

    #[serde(default, with = "rule::root", skip_serializing_if = "Option::is_none")]
    pub second_scan: Option<Group>,
}

// ─── Strategy ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,

    /// Unique across all strategies.
    pub name: String,

    pub description: Option<String>,

    /// Market-data adapter id, e.g. `"upbit"`.
    pub broker: String,

    /// Market the snapshot is taken from, e.g. `"KRW"` (a pair such as
    /// `"KRW-BTC"` selects its quote market).
    pub market: String,

    pub scan_rules: ScanRules,

    /// Only active strategies can be scanned or scheduled.
    pub is_active: bool,

    /// Crontab expression the scheduler starts the scan on, e.g. `"*/5 * * * *"`.
    pub cron_schedule: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Payload of `POST /api/v1/strategies`.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub broker: String,
    pub market: String,
    #[serde(default)]
    pub scan_rules: ScanRules,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub cron_schedule: Option<String>,
}

/// Payload of `PUT /api/v1/strategies/:id`; only the fields present change.
///
/// The nullable fields distinguish "absent" (`None`, keep) from an explicit
/// `null` (`Some(None)`, clear).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StrategyUpdate {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    pub broker: Option<String>,
    pub market: Option<String>,
    pub scan_rules: Option<ScanRules>,
    pub is_active: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub cron_schedule: Option<Option<String>>,
}

/// Wraps any value that is present, `null` included, in `Some`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl StrategyCreate {
    /// Materialises the payload with a store-assigned id.
    pub fn into_strategy(self, id: i64) -> Strategy {
        Strategy {
            id,
            name: self.name,
            description: self.description,
            broker: self.broker,
            market: self.market,
            scan_rules: self.scan_rules,
            is_active: self.is_active,
            cron_schedule: normalize_cron(self.cron_schedule),
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

impl StrategyUpdate {
    /// Applies the present fields and stamps `updated_at`.
    pub fn apply_to(self, strategy: &mut Strategy) {
        if let Some(name) = self.name {
            strategy.name = name;
        }
        if let Some(description) = self.description {
            strategy.description = description;
        }
        if let Some(broker) = self.broker {
            strategy.broker = broker;
        }
        if let Some(market) = self.market {
            strategy.market = market;
        }
        if let Some(rules) = self.scan_rules {
            strategy.scan_rules = rules;
        }
        if let Some(active) = self.is_active {
            strategy.is_active = active;
        }
        if let Some(cron) = self.cron_schedule {
            strategy.cron_schedule = normalize_cron(cron);
        }
        strategy.updated_at = Some(Utc::now());
    }
}

#[cfg(test)]
impl Strategy {
    /// An active, unscheduled strategy on `broker` / `"KRW"`.
    pub fn fixture(id: i64, name: &str, broker: &str, scan_rules: ScanRules) -> Self {
        Strategy {
            id,
            name: name.to_string(),
            description: None,
            broker: broker.to_string(),
            market: "KRW".to_string(),
            scan_rules,
            is_active: true,
            cron_schedule: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// Blank cron strings mean "not scheduled".
fn normalize_cron(cron: Option<String>) -> Option<String> {
    cron.map(|c| c.trim().to_string()).filter(|c| !c.is_empty())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
