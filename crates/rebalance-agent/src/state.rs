use anyhow::{Context, Result};
use async_trait::async_trait;
use harvest_core::{CooldownLedger, PolicyConfig, LEDGER_KEY};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Durable string key-value storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// `agent_state` table over any sqlx-supported database.
pub struct SqliteStateStore {
    db_pool: sqlx::AnyPool,
}

impl SqliteStateStore {
    pub fn new(db_pool: sqlx::AnyPool) -> Self {
        Self { db_pool }
    }

    pub async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM agent_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM agent_state WHERE key = ?")
            .bind(key)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }
}

/// Process-local store, used for backtests and tests
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Load the cooldown ledger, seeding every universe symbol at the sentinel.
///
/// With `refresh` the stored ledger is deleted instead of merged.
pub async fn load_ledger(
    store: &dyn KeyValueStore,
    policy: &PolicyConfig,
    refresh: bool,
) -> Result<CooldownLedger> {
    let mut ledger = CooldownLedger::seeded(policy.universe());

    if refresh {
        store.delete(LEDGER_KEY).await?;
        tracing::info!("Cooldown ledger reset to sentinel for {} symbols", ledger.len());
        return Ok(ledger);
    }

    if let Some(json) = store.get(LEDGER_KEY).await? {
        let stored = CooldownLedger::parse_json(&json).context("Stored cooldown ledger is corrupt")?;
        tracing::info!("Loaded {} cooldown entries", stored.len());
        ledger.merge(stored);
    }
    Ok(ledger)
}

pub async fn save_ledger(store: &dyn KeyValueStore, ledger: &CooldownLedger) -> Result<()> {
    store.put(LEDGER_KEY, &ledger.to_json()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use harvest_core::SENTINEL_LAST_SOLD;
    use sqlx::any::AnyPoolOptions;

    async fn sqlite_store() -> SqliteStateStore {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStateStore::new(pool);
        store.init_tables().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_sqlite_put_get_delete() {
        let store = sqlite_store().await;
        assert_eq!(store.get("k").await.unwrap(), None);

        store.put("k", "one").await.unwrap();
        store.put("k", "two").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ledger_round_trip_through_store() {
        let store = sqlite_store().await;
        let policy = PolicyConfig::diversified_default();
        let sold = Utc.with_ymd_and_hms(2024, 2, 1, 15, 0, 0).unwrap();

        let mut ledger = load_ledger(&store, &policy, false).await.unwrap();
        assert_eq!(ledger.last_sold("VOO"), SENTINEL_LAST_SOLD);
        ledger.record_sale("VOO", sold);
        save_ledger(&store, &ledger).await.unwrap();

        let restored = load_ledger(&store, &policy, false).await.unwrap();
        assert_eq!(restored.last_sold("VOO"), sold.timestamp());
        assert_eq!(restored.len(), policy.universe().len());
    }

    #[tokio::test]
    async fn test_refresh_discards_stored_ledger() {
        let store = MemoryStore::default();
        let policy = PolicyConfig::diversified_default();
        store
            .put(LEDGER_KEY, r#"{"VOO": 1700000000}"#)
            .await
            .unwrap();

        let ledger = load_ledger(&store, &policy, true).await.unwrap();
        assert_eq!(ledger.last_sold("VOO"), SENTINEL_LAST_SOLD);
        assert_eq!(store.get(LEDGER_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_is_an_error() {
        let store = MemoryStore::default();
        store.put(LEDGER_KEY, "[1, 2").await.unwrap();
        let policy = PolicyConfig::diversified_default();
        assert!(load_ledger(&store, &policy, false).await.is_err());
    }
}
