//! # db — PostgreSQL strategy store
//!
//! Compiled with `--features postgres`.  Used when `DATABASE_URL` is set.
//!
//! The `strategies` table is created on connect (`migrations/001_strategies.sql`);
//! `scan_rules` is stored as JSONB in the same shape the API accepts.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use tracing::info;

use crate::models::{ScanRules, Strategy, StrategyCreate, StrategyUpdate};
use crate::store::{StoreError, StrategyStore};

// ─── Pool Init ────────────────────────────────────────────────────────────────

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to PostgreSQL...");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::query(include_str!("../migrations/001_strategies.sql"))
            .execute(&pool)
            .await
            .context("Failed to run migration 001_strategies.sql")?;

        info!("✅ PostgreSQL connected and migrations applied");
        Ok(Self { pool })
    }
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct StrategyRow {
    id: i64,
    name: String,
    description: Option<String>,
    broker: String,
    market: String,
    scan_rules: Json<ScanRules>,
    is_active: bool,
    cron_schedule: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<StrategyRow> for Strategy {
    fn from(row: StrategyRow) -> Self {
        Strategy {
            id: row.id,
            name: row.name,
            description: row.description,
            broker: row.broker,
            market: row.market,
            scan_rules: row.scan_rules.0,
            is_active: row.is_active,
            cron_schedule: row.cron_schedule,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const COLUMNS: &str = "id, name, description, broker, market, scan_rules, is_active, \
                       cron_schedule, created_at, updated_at";

/// Unique-violation on `name` becomes [`StoreError::DuplicateName`].
fn map_err(err: sqlx::Error, name: &str, what: &'static str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StoreError::DuplicateName(name.to_string())
        }
        _ => StoreError::Backend(anyhow::Error::new(err).context(what)),
    }
}

#[async_trait]
impl StrategyStore for PgStore {
    async fn get(&self, id: i64) -> Result<Option<Strategy>, StoreError> {
        let row = sqlx::query_as::<_, StrategyRow>(&format!(
            "SELECT {COLUMNS} FROM strategies WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err(e, "", "get strategy failed"))?;
        Ok(row.map(Into::into))
    }

    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<Strategy>, StoreError> {
        let rows = sqlx::query_as::<_, StrategyRow>(&format!(
            "SELECT {COLUMNS} FROM strategies ORDER BY id OFFSET $1 LIMIT $2"
        ))
        .bind(i64::try_from(skip).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err(e, "", "list strategies failed"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create(&self, input: StrategyCreate) -> Result<Strategy, StoreError> {
        let draft = input.into_strategy(0);
        let row = sqlx::query_as::<_, StrategyRow>(&format!(
            "INSERT INTO strategies \
               (name, description, broker, market, scan_rules, is_active, cron_schedule, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {COLUMNS}"
        ))
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(&draft.broker)
        .bind(&draft.market)
        .bind(Json(&draft.scan_rules))
        .bind(draft.is_active)
        .bind(&draft.cron_schedule)
        .bind(draft.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_err(e, &draft.name, "insert strategy failed"))?;
        Ok(row.into())
    }

    async fn update(&self, id: i64, patch: StrategyUpdate) -> Result<Option<Strategy>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_err(e, "", "begin transaction failed"))?;

        let current = sqlx::query_as::<_, StrategyRow>(&format!(
            "SELECT {COLUMNS} FROM strategies WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_err(e, "", "load strategy failed"))?;
        let Some(current) = current else {
            return Ok(None);
        };

        let mut strategy: Strategy = current.into();
        patch.apply_to(&mut strategy);

        let row = sqlx::query_as::<_, StrategyRow>(&format!(
            "UPDATE strategies SET \
               name = $2, description = $3, broker = $4, market = $5, scan_rules = $6, \
               is_active = $7, cron_schedule = $8, updated_at = $9 \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(&strategy.name)
        .bind(&strategy.description)
        .bind(&strategy.broker)
        .bind(&strategy.market)
        .bind(Json(&strategy.scan_rules))
        .bind(strategy.is_active)
        .bind(&strategy.cron_schedule)
        .bind(strategy.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_err(e, &strategy.name, "update strategy failed"))?;

        tx.commit()
            .await
            .map_err(|e| map_err(e, "", "commit failed"))?;
        Ok(Some(row.into()))
    }

    async fn delete(&self, id: i64) -> Result<Option<Strategy>, StoreError> {
        let row = sqlx::query_as::<_, StrategyRow>(&format!(
            "DELETE FROM strategies WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_err(e, "", "delete strategy failed"))?;
        Ok(row.map(Into::into))
    }
}
