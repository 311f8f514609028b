//! Remembered UI preferences behind an injected key-value store.

use crate::db::{self, Pool};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>>;

    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<()>;
}

/// Preferences persisted in the `preferences` table as JSON text.
#[derive(Clone)]
pub struct SqlitePreferences {
    pool: Pool,
}

impl SqlitePreferences {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceStore for SqlitePreferences {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        match db::get_preference(&self.pool, scope, key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("preference {}/{} is not JSON", scope, key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<()> {
        db::set_preference(&self.pool, scope, key, &value.to_string()).await
    }
}

#[derive(Clone, Default)]
pub struct MemoryPreferences {
    values: Arc<Mutex<HashMap<(String, String), Value>>>,
}

#[async_trait]
impl PreferenceStore for MemoryPreferences {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        let guard = self.values.lock().await;
        Ok(guard.get(&(scope.to_string(), key.to_string())).cloned())
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<()> {
        self.values
            .lock()
            .await
            .insert((scope.to_string(), key.to_string()), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_round_trips_by_scope() {
        let store = MemoryPreferences::default();
        store.set("browser:sa1", "sort", json!({"column": "nome"})).await.unwrap();
        assert_eq!(
            store.get("browser:sa1", "sort").await.unwrap(),
            Some(json!({"column": "nome"}))
        );
        assert_eq!(store.get("browser:sb1", "sort").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_store_overwrites() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = SqlitePreferences::new(pool);
        store.set("tasks", "recent", json!(["call"])).await.unwrap();
        store.set("tasks", "recent", json!(["visit", "call"])).await.unwrap();
        assert_eq!(
            store.get("tasks", "recent").await.unwrap(),
            Some(json!(["visit", "call"]))
        );
    }
}
