//! # config
//!
//! Runtime settings read from the environment (`.env` is loaded by `main`).
//!
//! | Variable                  | Default                 |
//! |---------------------------|-------------------------|
//! | `BIND_ADDR`               | `0.0.0.0:8000`          |
//! | `UPBIT_BASE_URL`          | `https://api.upbit.com` |
//! | `UPBIT_REQUESTS_PER_SEC`  | `8`                     |
//! | `SCAN_INTERVAL_SECS`      | `60`                    |
//! | `SCAN_EMPTY_RETRY_SECS`   | `10`                    |
//! | `SCAN_ERROR_BACKOFF_SECS` | `30`                    |
//! | `SCAN_PHASE2_CONCURRENCY` | `8`                     |
//! | `SCAN_SERIES_COUNT`       | `200`                   |
//! | `SCAN_PHASE2_MODE`        | `availability`          |
//! | `BROADCAST_CAPACITY`      | `256`                   |
//! | `DATABASE_URL`            | unset (in-memory store) |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

// ─── Scan Loop ────────────────────────────────────────────────────────────────

/// How phase 2 confirms a phase-1 survivor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase2Mode {
    /// Every required series must be fetchable and non-empty.
    #[default]
    Availability,
    /// As above, then `second_scan` must also hold on the latest candles.
    Evaluate,
}

impl FromStr for Phase2Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "availability" => Ok(Phase2Mode::Availability),
            "evaluate" => Ok(Phase2Mode::Evaluate),
            other => Err(format!("unknown phase-2 mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Sleep between completed cycles.
    pub scan_interval: Duration,
    /// Wait before re-fetching after an empty snapshot.
    pub empty_snapshot_retry: Duration,
    /// Wait after a transient cycle failure.
    pub error_backoff: Duration,
    /// Max phase-1 survivors confirmed at once.
    pub phase2_concurrency: usize,
    /// Candles requested per series.
    pub series_count: usize,
    pub phase2_mode: Phase2Mode,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            empty_snapshot_retry: Duration::from_secs(10),
            error_backoff: Duration::from_secs(30),
            phase2_concurrency: 8,
            series_count: 200,
            phase2_mode: Phase2Mode::Availability,
        }
    }
}

impl ScanConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            scan_interval: Duration::from_secs(env_u64("SCAN_INTERVAL_SECS", d.scan_interval.as_secs())),
            empty_snapshot_retry: Duration::from_secs(env_u64(
                "SCAN_EMPTY_RETRY_SECS",
                d.empty_snapshot_retry.as_secs(),
            )),
            error_backoff: Duration::from_secs(env_u64("SCAN_ERROR_BACKOFF_SECS", d.error_backoff.as_secs())),
            phase2_concurrency: env_usize("SCAN_PHASE2_CONCURRENCY", d.phase2_concurrency).max(1),
            series_count: env_usize("SCAN_SERIES_COUNT", d.series_count).max(1),
            phase2_mode: match std::env::var("SCAN_PHASE2_MODE") {
                Ok(raw) => raw.parse().unwrap_or_else(|e: String| {
                    warn!("{e}, falling back to availability");
                    Phase2Mode::Availability
                }),
                Err(_) => d.phase2_mode,
            },
        }
    }
}

// ─── Brokers ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UpbitConfig {
    pub base_url: String,
    pub requests_per_sec: u32,
}

impl Default for UpbitConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.upbit.com".to_string(),
            requests_per_sec: 8,
        }
    }
}

impl UpbitConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: std::env::var("UPBIT_BASE_URL").unwrap_or(d.base_url),
            requests_per_sec: env_u32("UPBIT_REQUESTS_PER_SEC", d.requests_per_sec),
        }
    }
}

// ─── App ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub upbit: UpbitConfig,
    pub scan: ScanConfig,
    pub broadcast_capacity: usize,
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let raw_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let bind_addr = raw_addr
            .parse()
            .with_context(|| format!("BIND_ADDR '{raw_addr}' is not a socket address"))?;

        Ok(Self {
            bind_addr,
            upbit: UpbitConfig::from_env(),
            scan: ScanConfig::from_env(),
            broadcast_capacity: env_usize("BROADCAST_CAPACITY", 256).max(1),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
        })
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let scan = ScanConfig::default();
        assert_eq!(scan.scan_interval, Duration::from_secs(60));
        assert_eq!(scan.empty_snapshot_retry, Duration::from_secs(10));
        assert_eq!(scan.error_backoff, Duration::from_secs(30));
        assert_eq!(scan.phase2_concurrency, 8);
        assert_eq!(scan.phase2_mode, Phase2Mode::Availability);
    }

    #[test]
    fn phase2_mode_parses_case_insensitively() {
        assert_eq!("Evaluate".parse::<Phase2Mode>(), Ok(Phase2Mode::Evaluate));
        assert_eq!(" availability ".parse::<Phase2Mode>(), Ok(Phase2Mode::Availability));
        assert!("strict".parse::<Phase2Mode>().is_err());
    }
}
