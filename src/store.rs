//! # store
//!
//! Strategy persistence behind the [`StrategyStore`] trait.
//!
//! [`MemoryStore`] is the default.  With the `postgres` feature and
//! `DATABASE_URL` set, `main` uses [`crate::db::PgStore`] instead.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{Strategy, StrategyCreate, StrategyUpdate};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a strategy named '{0}' already exists")]
    DuplicateName(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait StrategyStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Strategy>, StoreError>;

    /// Strategies ordered by id.
    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<Strategy>, StoreError>;

    async fn create(&self, input: StrategyCreate) -> Result<Strategy, StoreError>;

    /// `Ok(None)` when `id` does not exist.
    async fn update(&self, id: i64, patch: StrategyUpdate) -> Result<Option<Strategy>, StoreError>;

    /// Returns the removed strategy, `Ok(None)` when `id` does not exist.
    async fn delete(&self, id: i64) -> Result<Option<Strategy>, StoreError>;
}

// ─── In-Memory ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Strategy>,
}

impl Table {
    fn name_taken(&self, name: &str, except: Option<i64>) -> bool {
        self.rows
            .values()
            .any(|s| s.name == name && Some(s.id) != except)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StrategyStore for MemoryStore {
    async fn get(&self, id: i64) -> Result<Option<Strategy>, StoreError> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<Strategy>, StoreError> {
        Ok(self
            .table
            .read()
            .await
            .rows
            .values()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create(&self, input: StrategyCreate) -> Result<Strategy, StoreError> {
        let mut table = self.table.write().await;
        if table.name_taken(&input.name, None) {
            return Err(StoreError::DuplicateName(input.name));
        }
        table.next_id += 1;
        let strategy = input.into_strategy(table.next_id);
        table.rows.insert(strategy.id, strategy.clone());
        Ok(strategy)
    }

    async fn update(&self, id: i64, patch: StrategyUpdate) -> Result<Option<Strategy>, StoreError> {
        let mut table = self.table.write().await;
        if let Some(name) = &patch.name {
            if table.name_taken(name, Some(id)) {
                return Err(StoreError::DuplicateName(name.clone()));
            }
        }
        let Some(current) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        patch.apply_to(current);
        Ok(Some(current.clone()))
    }

    async fn delete(&self, id: i64) -> Result<Option<Strategy>, StoreError> {
        Ok(self.table.write().await.rows.remove(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanRules;

    fn input(name: &str) -> StrategyCreate {
        StrategyCreate {
            name: name.to_string(),
            description: None,
            broker: "mock".into(),
            market: "KRW".into(),
            scan_rules: ScanRules::default(),
            is_active: true,
            cron_schedule: None,
        }
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let store = MemoryStore::new();
        let a = store.create(input("a")).await.unwrap();
        let b = store.create(input("b")).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));

        assert_eq!(store.get(1).await.unwrap().unwrap().name, "a");
        assert_eq!(store.list(1, 10).await.unwrap(), vec![b.clone()]);

        let patch = StrategyUpdate {
            market: Some("BTC".into()),
            ..Default::default()
        };
        let updated = store.update(2, patch).await.unwrap().unwrap();
        assert_eq!(updated.market, "BTC");

        assert_eq!(store.delete(1).await.unwrap().map(|s| s.id), Some(1));
        assert!(store.get(1).await.unwrap().is_none());
        assert!(store.delete(1).await.unwrap().is_none());
        assert!(store.update(1, StrategyUpdate::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn names_are_unique() {
        let store = MemoryStore::new();
        store.create(input("a")).await.unwrap();
        store.create(input("b")).await.unwrap();

        assert!(matches!(
            store.create(input("a")).await,
            Err(StoreError::DuplicateName(n)) if n == "a"
        ));
        let rename = StrategyUpdate {
            name: Some("a".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.update(2, rename).await,
            Err(StoreError::DuplicateName(_))
        ));
        // Keeping one's own name is fine.
        let same = StrategyUpdate {
            name: Some("b".into()),
            ..Default::default()
        };
        assert!(store.update(2, same).await.is_ok());
    }
}
