//! Versioned persisted state for the storefront caches.
//!
//! Each cache saves an envelope `{ "state": ..., "version": N }` under its own
//! store name. Older envelopes are migrated on load; anything that can't be
//! migrated is discarded so the cache starts fresh.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::KeyValueStore;

/// A cache state that can be persisted through a [`KeyValueStore`].
pub trait Persistable: Serialize + DeserializeOwned + Send + Sync {
  /// Current schema version of the state
  const VERSION: u32;

  /// Key the envelope is stored under (e.g. "profile-storage")
  fn store_name() -> &'static str;

  /// Upgrade a state saved by an older version.
  ///
  /// The default refuses, which drops the old state.
  fn migrate(state: Value, from_version: u32) -> Result<Value> {
    let _ = state;
    Err(eyre!(
      "no migration from version {} to {}",
      from_version,
      Self::VERSION
    ))
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
  state: Value,
  #[serde(default)]
  version: u32,
}

/// Typed handle on one persisted cache.
pub struct PersistedStore<T: Persistable> {
  store: Arc<dyn KeyValueStore>,
  _state: PhantomData<fn() -> T>,
}

impl<T: Persistable> Clone for PersistedStore<T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      _state: PhantomData,
    }
  }
}

impl<T: Persistable> PersistedStore<T> {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self {
      store,
      _state: PhantomData,
    }
  }

  /// Load the saved state, migrating it when it is older than `T::VERSION`.
  ///
  /// Returns `None` when nothing usable is stored.
  pub async fn load(&self) -> Result<Option<T>> {
    let name = T::store_name();
    let raw = match self.store.get_item(name).await? {
      Some(raw) => raw,
      None => return Ok(None),
    };

    let envelope: Envelope = match serde_json::from_value(raw) {
      Ok(envelope) => envelope,
      Err(e) => {
        warn!(store = name, "Discarding unreadable persisted state: {}", e);
        return Ok(None);
      }
    };

    let state = if envelope.version == T::VERSION {
      envelope.state
    } else if envelope.version < T::VERSION {
      match T::migrate(envelope.state, envelope.version) {
        Ok(migrated) => {
          debug!(store = name, from = envelope.version, to = T::VERSION, "migrated persisted state");
          migrated
        }
        Err(e) => {
          warn!(store = name, "Discarding persisted state: {}", e);
          return Ok(None);
        }
      }
    } else {
      warn!(
        store = name,
        found = envelope.version,
        expected = T::VERSION,
        "Discarding persisted state from a newer version"
      );
      return Ok(None);
    };

    match serde_json::from_value::<T>(state) {
      Ok(value) => {
        if envelope.version != T::VERSION {
          // Write back so the migration runs once
          self.save(&value).await?;
        }
        Ok(Some(value))
      }
      Err(e) => {
        warn!(store = name, "Discarding persisted state that no longer fits: {}", e);
        Ok(None)
      }
    }
  }

  pub async fn save(&self, value: &T) -> Result<()> {
    let state = serde_json::to_value(value)
      .map_err(|e| eyre!("Failed to serialize {}: {}", T::store_name(), e))?;
    let envelope = serde_json::to_value(Envelope {
      state,
      version: T::VERSION,
    })
    .map_err(|e| eyre!("Failed to serialize {}: {}", T::store_name(), e))?;

    self.store.set_item(T::store_name(), &envelope).await
  }

  pub async fn clear(&self) -> Result<()> {
    self.store.remove_item(T::store_name()).await
  }
}
