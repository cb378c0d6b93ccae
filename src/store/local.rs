//! Local durable store backed by SQLite.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;

use super::KeyValueStore;
use crate::db::Database;

/// SQLite-based key-value store. Always available, never synced.
#[derive(Clone)]
pub struct SqliteStore {
  db: Arc<Database>,
}

impl SqliteStore {
  /// Create a store on top of an already opened database.
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Ok(Self::new(Arc::new(Database::open()?)))
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::new(Arc::new(Database::open_in_memory()?)))
  }

  /// All keys currently stored, sorted.
  pub fn keys(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT key FROM kv_store ORDER BY key")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let keys = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| eyre!("Failed to query keys: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read key: {}", e))?;

      Ok(keys)
    })
  }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
  async fn get_item(&self, key: &str) -> Result<Option<Value>> {
    let data: Option<Vec<u8>> = self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT value FROM kv_store WHERE key = ?",
          params![key],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read {}: {}", key, e))
    })?;

    match data {
      Some(data) => {
        let value = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize {}: {}", key, e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  async fn set_item(&self, key: &str, value: &Value) -> Result<()> {
    let data =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;

    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
           VALUES (?, ?, datetime('now'))",
          params![key, data],
        )
        .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
      Ok(())
    })
  }

  async fn remove_item(&self, key: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute("DELETE FROM kv_store WHERE key = ?", params![key])
        .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;
      Ok(())
    })
  }
}
