//! # engine::scheduler
//!
//! Starts scans on each strategy's crontab cadence.  One tokio task per
//! scheduled strategy sleeps until the next fire time and calls
//! [`ScanManager::start`], which is a no-op while the previous loop still runs.
//!
//! Expressions use standard 5-field crontab syntax
//! (`minute hour day-of-month month day-of-week`, `0`/`7` = Sunday).  6- and
//! 7-field expressions (leading seconds, trailing year) are passed to the
//! `cron` crate unchanged, with its own day-of-week numbering (`1` = Sunday).

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use cron::Schedule;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::manager::ScanManager;
use crate::models::Strategy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cron expression '{expr}': {reason}")]
pub struct CronError {
    pub expr: String,
    pub reason: String,
}

/// Parses a crontab expression into a [`Schedule`].
pub fn parse_cron(expr: &str) -> Result<Schedule, CronError> {
    let fail = |reason: String| CronError {
        expr: expr.to_string(),
        reason,
    };

    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, dom, month, dow] => {
            let dow = crontab_weekdays(dow).map_err(fail)?;
            format!("0 {minute} {hour} {dom} {month} {dow}")
        }
        [_, _, _, _, _, _] | [_, _, _, _, _, _, _] => fields.join(" "),
        _ => {
            return Err(fail(format!(
                "expected 5 fields (6 or 7 with seconds/year), found {}",
                fields.len()
            )))
        }
    };

    Schedule::from_str(&normalized).map_err(|e| fail(e.to_string()))
}

/// Rewrites a crontab day-of-week field (`0`–`7`, Sunday = 0 or 7) into the
/// `cron` crate's numbering (`1`–`7`, Sunday = 1).  Names pass through.
fn crontab_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let number = |raw: &str| {
        raw.parse::<u32>()
            .ok()
            .filter(|n| *n <= 7)
            .ok_or_else(|| format!("invalid day-of-week '{raw}'"))
    };

    let mut days = BTreeSet::new();
    let mut names = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        if base.chars().any(|c| c.is_ascii_alphabetic()) {
            names.push(item.to_string());
            continue;
        }

        let step = match step {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| format!("invalid step '{raw}'"))?,
            None => 1,
        };
        let (lo, hi) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((a, b)) => (number(a)?, number(b)?),
            None if step > 1 => (number(base)?, 6),
            None => {
                let n = number(base)?;
                (n, n)
            }
        };
        if lo > hi {
            return Err(format!("invalid day-of-week range '{base}'"));
        }
        days.extend((lo..=hi).step_by(step).map(|n| n % 7 + 1));
    }

    let mut parts: Vec<String> = days.iter().map(ToString::to_string).collect();
    parts.extend(names);
    Ok(parts.join(","))
}

// ─── Scheduler ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Scheduler {
    jobs: Arc<Mutex<HashMap<i64, JoinHandle<()>>>>,
    scans: ScanManager,
}

impl Scheduler {
    pub fn new(scans: ScanManager) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            scans,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<i64, JoinHandle<()>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces any job for `strategy`.  A job is only created for an active
    /// strategy with a cron expression; returns whether one was.
    pub fn schedule(&self, strategy: Arc<Strategy>) -> Result<bool, CronError> {
        self.unschedule(strategy.id);

        let Some(expr) = strategy.cron_schedule.as_deref().filter(|_| strategy.is_active) else {
            return Ok(false);
        };
        let schedule = parse_cron(expr)?;

        let strategy_id = strategy.id;
        info!(strategy_id, cron = %expr, "Scan scheduled");

        let scans = self.scans.clone();
        let job = tokio::spawn(async move {
            while let Some(next) = schedule.upcoming(Utc).next() {
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                let started = scans.start(strategy.clone());
                debug!(strategy_id = strategy.id, started, "⏰ cron fired");
            }
        });

        self.jobs().insert(strategy_id, job);
        Ok(true)
    }

    pub fn unschedule(&self, strategy_id: i64) -> bool {
        match self.jobs().remove(&strategy_id) {
            Some(job) => {
                job.abort();
                debug!(strategy_id, "schedule removed");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, strategy_id: i64) -> bool {
        self.jobs().contains_key(&strategy_id)
    }

    /// Aborts every job.  Running scans are left to the manager.
    pub fn shutdown(&self) {
        for (_, job) in self.jobs().drain() {
            job.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{StaticBroker, StaticBrokers};
    use crate::config::ScanConfig;
    use crate::events::Notifier;
    use crate::models::{Frame, ScanRules};
    use std::time::Duration;

    #[test]
    fn accepts_standard_crontab() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 9 * * 1-5").is_ok());
        assert!(parse_cron("30 8 1 * 0").is_ok());
        assert!(parse_cron("*/10 * * * * *").is_ok());
    }

    #[test]
    fn rejects_malformed_expressions() {
        let err = parse_cron("* * * *").unwrap_err();
        assert!(err.reason.contains("found 4"));
        assert!(parse_cron("61 * * * *").is_err());
        assert!(parse_cron("* * * * 9").is_err());
        assert!(parse_cron("").is_err());
    }

    #[test]
    fn weekdays_follow_crontab_numbering() {
        assert_eq!(crontab_weekdays("0").unwrap(), "1");
        assert_eq!(crontab_weekdays("7").unwrap(), "1");
        assert_eq!(crontab_weekdays("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(crontab_weekdays("5-7").unwrap(), "1,6,7");
        assert_eq!(crontab_weekdays("*/2").unwrap(), "1,3,5,7");
        assert_eq!(crontab_weekdays("MON-FRI").unwrap(), "MON-FRI");
        assert!(crontab_weekdays("5-1").is_err());
    }

    fn scheduler() -> Scheduler {
        let broker = StaticBroker::new().snapshot(Frame::standard().with_row("KRW-BTC", vec![1.0; 6]));
        let scans = ScanManager::new(
            ScanConfig::default(),
            Notifier::new(16),
            Arc::new(StaticBrokers(Arc::new(broker))),
        );
        Scheduler::new(scans)
    }

    fn strategy(active: bool, cron: Option<&str>) -> Arc<Strategy> {
        let mut s = Strategy::fixture(3, "cron", "static", ScanRules::default());
        s.is_active = active;
        s.cron_schedule = cron.map(str::to_string);
        Arc::new(s)
    }

    #[tokio::test]
    async fn only_active_strategies_with_cron_are_scheduled() {
        let sched = scheduler();
        assert_eq!(sched.schedule(strategy(false, Some("* * * * *"))), Ok(false));
        assert_eq!(sched.schedule(strategy(true, None)), Ok(false));
        assert!(!sched.is_scheduled(3));
        assert!(sched.schedule(strategy(true, Some("nope"))).is_err());
        assert_eq!(sched.schedule(strategy(true, Some("* * * * *"))), Ok(true));
        assert!(sched.is_scheduled(3));

        // Rescheduling as inactive drops the job.
        assert_eq!(sched.schedule(strategy(false, Some("* * * * *"))), Ok(false));
        assert!(!sched.is_scheduled(3));
    }

    #[tokio::test]
    async fn job_starts_the_scan() {
        let sched = scheduler();
        sched.schedule(strategy(true, Some("* * * * * *"))).unwrap();

        tokio::time::timeout(Duration::from_secs(3), async {
            while !sched.scans.is_running(3) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("cron job fired");

        assert!(sched.unschedule(3));
        sched.scans.stop_all().await;
    }
}
