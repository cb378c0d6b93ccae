//! Key-value stores shared by the storefront caches.
//!
//! Every store speaks the same three operations over string keys and JSON
//! values, so the resilient adapter can stand in for the local store anywhere.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

pub use local::SqliteStore;
pub use remote::{RemoteError, RemoteStore};

/// A string-keyed store of JSON values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
  /// Value previously stored under `key`, or `None` when absent.
  async fn get_item(&self, key: &str) -> Result<Option<Value>>;

  /// Store `value` under `key`, replacing any previous value.
  async fn set_item(&self, key: &str, value: &Value) -> Result<()>;

  /// Delete `key`. Removing a missing key is not an error.
  async fn remove_item(&self, key: &str) -> Result<()>;
}

/// In-process store that keeps entries in a map. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
  async fn get_item(&self, key: &str) -> Result<Option<Value>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  async fn set_item(&self, key: &str, value: &Value) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.clone());
    Ok(())
  }

  async fn remove_item(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }
}
