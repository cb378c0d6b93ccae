//! Circuit breaker guarding calls to the remote store.
//!
//! Two states, tracked by `is_closed`:
//!
//! ```text
//! Closed → Open:   failure_count reaches max_failures
//! Open   → probe:  reset_timeout elapsed since the last failure
//! probe  → Closed: the probe succeeds (failure_count back to 0)
//! probe  → Open:   the probe fails (window restarts from now)
//! ```
//!
//! State is rehydrated from a [`BreakerStateStore`] on construction and saved
//! after every transition, so an open breaker stays open across restarts.

mod state_store;

pub use state_store::{BreakerStateStore, MemoryStateStore, SqliteStateStore, BREAKER_STATE_KEY};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;

/// Persisted breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerState {
  /// Failures recorded since the breaker last closed
  pub failure_count: u32,
  /// Time of the most recent failure, stored as epoch milliseconds
  #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
  pub last_failure_timestamp: Option<DateTime<Utc>>,
  /// `true` while remote attempts are permitted
  pub is_closed: bool,
}

impl Default for BreakerState {
  fn default() -> Self {
    Self {
      failure_count: 0,
      last_failure_timestamp: None,
      is_closed: true,
    }
  }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += chrono::Duration::milliseconds(by.as_millis() as i64);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Consecutive-failure circuit breaker with persisted state.
pub struct CircuitBreaker {
  config: BreakerConfig,
  state: Mutex<BreakerState>,
  store: Arc<dyn BreakerStateStore>,
  clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
  pub fn new(config: BreakerConfig, store: Arc<dyn BreakerStateStore>) -> Self {
    Self::with_clock(config, store, Arc::new(SystemClock))
  }

  /// Create a breaker, adopting any state the store already holds.
  pub fn with_clock(
    config: BreakerConfig,
    store: Arc<dyn BreakerStateStore>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let state = match store.load() {
      Ok(Some(state)) => {
        debug!(?state, "rehydrated circuit breaker state");
        state
      }
      Ok(None) => BreakerState::default(),
      Err(e) => {
        warn!("Failed to load circuit breaker state, starting closed: {}", e);
        BreakerState::default()
      }
    };

    Self {
      config,
      state: Mutex::new(state),
      store,
      clock,
    }
  }

  fn lock_state(&self) -> MutexGuard<'_, BreakerState> {
    // Lost updates are tolerated; a poisoned lock still holds usable state
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Snapshot of the current state.
  pub fn state(&self) -> BreakerState {
    self.lock_state().clone()
  }

  pub fn config(&self) -> BreakerConfig {
    self.config
  }

  /// Whether a remote attempt should be made right now.
  ///
  /// An open breaker lets a probe through once `reset_timeout` has passed since
  /// the last failure. This does not change the state.
  pub fn can_try_remote(&self) -> bool {
    let state = self.lock_state();
    if state.is_closed {
      return true;
    }

    match state.last_failure_timestamp {
      Some(last) => {
        let elapsed = self.clock.now() - last;
        elapsed.num_milliseconds() > self.config.reset_timeout_ms as i64
      }
      // Open without a recorded failure time: let a probe decide
      None => true,
    }
  }

  /// Record a successful remote call. Closes an open breaker.
  pub fn record_success(&self) {
    let snapshot = {
      let mut state = self.lock_state();
      if state.is_closed {
        return;
      }
      state.is_closed = true;
      state.failure_count = 0;
      state.clone()
    };

    info!("Circuit breaker closed, remote store reachable again");
    self.persist(&snapshot);
  }

  /// Record a failed remote call, opening the breaker at `max_failures`.
  pub fn record_failure(&self) {
    let now = self.clock.now();
    let (snapshot, opened) = {
      let mut state = self.lock_state();
      let was_closed = state.is_closed;
      state.failure_count = state.failure_count.saturating_add(1);
      state.last_failure_timestamp = Some(now);
      if state.failure_count >= self.config.max_failures {
        state.is_closed = false;
      }
      (state.clone(), was_closed && !state.is_closed)
    };

    if opened {
      warn!(
        failures = snapshot.failure_count,
        reset_timeout_ms = self.config.reset_timeout_ms,
        "Circuit breaker opened, skipping remote store"
      );
    } else {
      debug!(failures = snapshot.failure_count, "remote failure recorded");
    }
    self.persist(&snapshot);
  }

  /// Force the breaker closed and forget past failures.
  pub fn reset(&self) {
    let snapshot = {
      let mut state = self.lock_state();
      *state = BreakerState::default();
      state.clone()
    };

    info!("Circuit breaker reset");
    self.persist(&snapshot);
  }

  fn persist(&self, state: &BreakerState) {
    if let Err(e) = self.store.save(state) {
      warn!("Failed to persist circuit breaker state: {}", e);
    }
  }
}
