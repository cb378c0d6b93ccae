//! Persistence for breaker state.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::{Arc, Mutex};

use super::BreakerState;
use crate::db::Database;

/// Fixed record name for the breaker, apart from any caller key.
pub const BREAKER_STATE_KEY: &str = "circuit_breaker";

/// Where the breaker keeps its state between runs.
pub trait BreakerStateStore: Send + Sync {
  /// Previously saved state, or `None` on first run.
  fn load(&self) -> Result<Option<BreakerState>>;

  fn save(&self, state: &BreakerState) -> Result<()>;
}

/// State store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
  state: Mutex<Option<BreakerState>>,
  saves: Mutex<u32>,
}

impl MemoryStateStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start with a previously persisted state.
  pub fn with_state(state: BreakerState) -> Self {
    Self {
      state: Mutex::new(Some(state)),
      saves: Mutex::new(0),
    }
  }

  /// Number of `save` calls so far.
  pub fn save_count(&self) -> u32 {
    self.saves.lock().map(|s| *s).unwrap_or(0)
  }
}

impl BreakerStateStore for MemoryStateStore {
  fn load(&self) -> Result<Option<BreakerState>> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(state.clone())
  }

  fn save(&self, state: &BreakerState) -> Result<()> {
    *self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))? = Some(state.clone());
    *self
      .saves
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))? += 1;
    Ok(())
  }
}

/// State store in the local SQLite database, `breaker_state` table.
#[derive(Clone)]
pub struct SqliteStateStore {
  db: Arc<Database>,
}

impl SqliteStateStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl BreakerStateStore for SqliteStateStore {
  fn load(&self) -> Result<Option<BreakerState>> {
    let data: Option<Vec<u8>> = self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT data FROM breaker_state WHERE name = ?",
          params![BREAKER_STATE_KEY],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read breaker state: {}", e))
    })?;

    data
      .map(|data| {
        serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize breaker state: {}", e))
      })
      .transpose()
  }

  fn save(&self, state: &BreakerState) -> Result<()> {
    let data =
      serde_json::to_vec(state).map_err(|e| eyre!("Failed to serialize breaker state: {}", e))?;

    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO breaker_state (name, data, saved_at)
           VALUES (?, ?, datetime('now'))",
          params![BREAKER_STATE_KEY, data],
        )
        .map_err(|e| eyre!("Failed to save breaker state: {}", e))?;
      Ok(())
    })
  }
}
