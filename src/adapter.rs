//! Resilient adapter: remote store first, local store when the remote is down.
//!
//! Per call:
//!
//! ```text
//! breaker closed         → try remote
//! breaker open, expired  → try remote (probe)
//! breaker open           → local store, no remote attempt
//!
//! remote ok              → record success; getItem with no value defers to local
//! remote error           → record failure, local store
//! ```
//!
//! Remote trouble never reaches the caller. Only an error from the local store,
//! the last resort, is returned.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::store::{KeyValueStore, RemoteError, RemoteStore, SqliteStore};

/// Why a call was served by the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
  /// The breaker was open, the remote was not contacted
  CircuitOpen,
  /// The remote was tried and failed
  Remote(RemoteError),
}

impl fmt::Display for FallbackReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FallbackReason::CircuitOpen => write!(f, "circuit open"),
      FallbackReason::Remote(e) => write!(f, "remote failed: {}", e),
    }
  }
}

/// Which path served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Handled by the remote store
  Remote,
  /// Remote answered without a value, local store consulted
  RemoteEmptyDeferred,
  /// Remote failed, local store used
  RemoteFailedFellBack,
  /// Breaker open, local store used without trying the remote
  CircuitOpenSkipped,
}

impl fmt::Display for Outcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Outcome::Remote => "remote",
      Outcome::RemoteEmptyDeferred => "local (remote had no value)",
      Outcome::RemoteFailedFellBack => "local (remote failed)",
      Outcome::CircuitOpenSkipped => "local (circuit open)",
    };
    f.write_str(s)
  }
}

/// Hook for monitoring degraded-mode frequency.
pub trait FallbackObserver: Send + Sync {
  fn on_fallback(&self, key: &str, reason: &FallbackReason);
}

impl<F> FallbackObserver for F
where
  F: Fn(&str, &FallbackReason) + Send + Sync,
{
  fn on_fallback(&self, key: &str, reason: &FallbackReason) {
    self(key, reason)
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl FallbackObserver for NoopObserver {
  fn on_fallback(&self, _key: &str, _reason: &FallbackReason) {}
}

/// Logs every fallback at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl FallbackObserver for TracingObserver {
  fn on_fallback(&self, key: &str, reason: &FallbackReason) {
    warn!(key, %reason, "serving from local store");
  }
}

/// Remote store behind a circuit breaker, with a local store as fallback.
pub struct ResilientStore<L: KeyValueStore = SqliteStore> {
  remote: RemoteStore,
  local: L,
  breaker: Arc<CircuitBreaker>,
  observer: Arc<dyn FallbackObserver>,
}

impl<L: KeyValueStore> ResilientStore<L> {
  pub fn new(remote: RemoteStore, local: L, breaker: Arc<CircuitBreaker>) -> Self {
    Self {
      remote,
      local,
      breaker,
      observer: Arc::new(NoopObserver),
    }
  }

  pub fn with_observer(mut self, observer: impl FallbackObserver + 'static) -> Self {
    self.observer = Arc::new(observer);
    self
  }

  pub fn breaker(&self) -> &CircuitBreaker {
    &self.breaker
  }

  pub fn local(&self) -> &L {
    &self.local
  }

  /// Run `attempt` unless the breaker forbids it, and feed the result back
  /// into the breaker.
  async fn try_remote<T, Fut>(&self, attempt: Fut) -> std::result::Result<T, FallbackReason>
  where
    Fut: Future<Output = std::result::Result<T, RemoteError>>,
  {
    if !self.breaker.can_try_remote() {
      return Err(FallbackReason::CircuitOpen);
    }

    match attempt.await {
      Ok(value) => {
        self.breaker.record_success();
        Ok(value)
      }
      Err(e) => {
        self.breaker.record_failure();
        Err(FallbackReason::Remote(e))
      }
    }
  }

  fn fall_back(&self, op: &str, key: &str, reason: FallbackReason) -> Outcome {
    debug!(op, key, %reason, "falling back to local store");
    self.observer.on_fallback(key, &reason);
    match reason {
      FallbackReason::CircuitOpen => Outcome::CircuitOpenSkipped,
      FallbackReason::Remote(_) => Outcome::RemoteFailedFellBack,
    }
  }

  pub async fn get_item_with_outcome(&self, key: &str) -> Result<(Option<Value>, Outcome)> {
    match self.try_remote(self.remote.get_item(key)).await {
      Ok(Some(value)) => Ok((Some(value), Outcome::Remote)),
      Ok(None) => {
        debug!(key, "remote has no value, checking local store");
        let value = self.local.get_item(key).await?;
        Ok((value, Outcome::RemoteEmptyDeferred))
      }
      Err(reason) => {
        let outcome = self.fall_back("getItem", key, reason);
        let value = self.local.get_item(key).await?;
        Ok((value, outcome))
      }
    }
  }

  pub async fn set_item_with_outcome(&self, key: &str, value: &Value) -> Result<Outcome> {
    match self.try_remote(self.remote.set_item(key, value)).await {
      Ok(()) => Ok(Outcome::Remote),
      Err(reason) => {
        let outcome = self.fall_back("setItem", key, reason);
        self.local.set_item(key, value).await?;
        Ok(outcome)
      }
    }
  }

  pub async fn remove_item_with_outcome(&self, key: &str) -> Result<Outcome> {
    match self.try_remote(self.remote.remove_item(key)).await {
      Ok(()) => Ok(Outcome::Remote),
      Err(reason) => {
        let outcome = self.fall_back("removeItem", key, reason);
        self.local.remove_item(key).await?;
        Ok(outcome)
      }
    }
  }
}

#[async_trait]
impl<L: KeyValueStore> KeyValueStore for ResilientStore<L> {
  async fn get_item(&self, key: &str) -> Result<Option<Value>> {
    Ok(self.get_item_with_outcome(key).await?.0)
  }

  async fn set_item(&self, key: &str, value: &Value) -> Result<()> {
    self.set_item_with_outcome(key, value).await?;
    Ok(())
  }

  async fn remove_item(&self, key: &str) -> Result<()> {
    self.remove_item_with_outcome(key).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::breaker::{BreakerState, ManualClock, MemoryStateStore};
  use crate::config::BreakerConfig;
  use crate::store::MemoryStore;
  use chrono::{TimeZone, Utc};
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::Mutex;
  use std::time::Duration;
  use url::Url;
  use wiremock::matchers::{method, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  struct Harness<L: KeyValueStore> {
    store: ResilientStore<L>,
    clock: Arc<ManualClock>,
  }

  fn harness_with<L: KeyValueStore>(server: &MockServer, local: L) -> Harness<L> {
    let url = Url::parse(&server.uri()).unwrap();
    let remote = RemoteStore::new(url, Duration::from_millis(500), None).unwrap();
    let clock = Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
    ));
    let breaker = Arc::new(CircuitBreaker::with_clock(
      BreakerConfig::default(),
      Arc::new(MemoryStateStore::new()),
      clock.clone(),
    ));
    Harness {
      store: ResilientStore::new(remote, local, breaker),
      clock,
    }
  }

  fn harness(server: &MockServer) -> Harness<MemoryStore> {
    harness_with(server, MemoryStore::new())
  }

  async fn mount_failing_remote(server: &MockServer) {
    Mock::given(wiremock::matchers::any())
      .respond_with(ResponseTemplate::new(500))
      .mount(server)
      .await;
  }

  #[tokio::test]
  async fn test_round_trip_with_healthy_remote() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(query_param("method", "setItem"))
      .respond_with(ResponseTemplate::new(200))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(query_param("key", "profile"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": {"balance": 42}})))
      .expect(1)
      .mount(&server)
      .await;

    let h = harness(&server);
    let value = json!({"balance": 42});

    assert_eq!(
      h.store.set_item_with_outcome("profile", &value).await.unwrap(),
      Outcome::Remote
    );
    let (got, outcome) = h.store.get_item_with_outcome("profile").await.unwrap();
    assert_eq!(got, Some(value));
    assert_eq!(outcome, Outcome::Remote);
    // Healthy writes do not touch the local store
    assert!(h.store.local().is_empty());
  }

  #[tokio::test]
  async fn test_round_trip_with_failing_remote() {
    let server = MockServer::start().await;
    mount_failing_remote(&server).await;

    let h = harness(&server);
    let value = json!({"numbers": ["+15550100"], "total": 12.5});

    h.store.set_item("cart", &value).await.unwrap();
    assert_eq!(h.store.get_item("cart").await.unwrap(), Some(value));
  }

  #[tokio::test]
  async fn test_set_remove_get_returns_none() {
    let server = MockServer::start().await;
    mount_failing_remote(&server).await;

    let h = harness(&server);
    h.store.set_item("offers", &json!([1, 2, 3])).await.unwrap();
    h.store.remove_item("offers").await.unwrap();
    assert_eq!(h.store.get_item("offers").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_remove_with_healthy_remote_then_get_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": null})))
      .mount(&server)
      .await;

    let h = harness(&server);
    h.store.set_item("ivr", &json!({"greeting": "hi"})).await.unwrap();
    h.store.remove_item("ivr").await.unwrap();
    assert_eq!(h.store.get_item("ivr").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_empty_remote_success_defers_to_local() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": null})))
      .expect(1)
      .mount(&server)
      .await;

    let h = harness(&server);
    h.store
      .local()
      .set_item("payment_methods", &json!([{"id": "card_1"}]))
      .await
      .unwrap();

    let (value, outcome) = h.store.get_item_with_outcome("payment_methods").await.unwrap();
    assert_eq!(value, Some(json!([{"id": "card_1"}])));
    assert_eq!(outcome, Outcome::RemoteEmptyDeferred);
    // An empty answer is still a success for the breaker
    assert_eq!(h.store.breaker().state().failure_count, 0);
  }

  #[tokio::test]
  async fn test_single_failure_stays_below_threshold() {
    let server = MockServer::start().await;
    mount_failing_remote(&server).await;

    let h = harness(&server);
    h.store.set_item("profile", &json!({"balance": 42})).await.unwrap();

    let state = h.store.breaker().state();
    assert_eq!(state.failure_count, 1);
    assert!(state.is_closed);

    let (value, outcome) = h.store.get_item_with_outcome("profile").await.unwrap();
    assert_eq!(value, Some(json!({"balance": 42})));
    assert_eq!(outcome, Outcome::RemoteFailedFellBack);
  }

  #[tokio::test]
  async fn test_open_breaker_skips_remote_entirely() {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
      .respond_with(ResponseTemplate::new(502))
      .expect(3)
      .mount(&server)
      .await;

    let h = harness(&server);
    h.store.set_item("profile", &json!({"balance": 1})).await.unwrap();
    h.store.get_item("cart").await.unwrap();
    h.store.remove_item("offers").await.unwrap();
    assert!(!h.store.breaker().state().is_closed);

    let (value, outcome) = h.store.get_item_with_outcome("profile").await.unwrap();
    assert_eq!(value, Some(json!({"balance": 1})));
    assert_eq!(outcome, Outcome::CircuitOpenSkipped);
    // Skipped calls are not failures
    assert_eq!(h.store.breaker().state().failure_count, 3);

    server.verify().await;
  }

  #[tokio::test]
  async fn test_probe_success_closes_breaker() {
    let server = MockServer::start().await;
    let h = harness(&server);

    {
      let _failing = Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(500))
        .mount_as_scoped(&server)
        .await;
      for key in ["a", "b", "c"] {
        h.store.set_item(key, &json!(key)).await.unwrap();
      }
    }
    assert!(!h.store.breaker().can_try_remote());

    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": "fresh"})))
      .mount(&server)
      .await;

    // Still inside the cooldown
    let (_, outcome) = h.store.get_item_with_outcome("a").await.unwrap();
    assert_eq!(outcome, Outcome::CircuitOpenSkipped);

    h.clock.advance(Duration::from_millis(60_001));
    let (value, outcome) = h.store.get_item_with_outcome("a").await.unwrap();
    assert_eq!(value, Some(json!("fresh")));
    assert_eq!(outcome, Outcome::Remote);

    let state = h.store.breaker().state();
    assert!(state.is_closed);
    assert_eq!(state.failure_count, 0);
    assert_eq!(
      h.store.get_item_with_outcome("b").await.unwrap().1,
      Outcome::Remote
    );
  }

  #[tokio::test]
  async fn test_failed_probe_reopens_window() {
    let server = MockServer::start().await;
    mount_failing_remote(&server).await;
    let h = harness(&server);

    for _ in 0..3 {
      h.store.get_item("profile").await.unwrap();
    }
    h.clock.advance(Duration::from_secs(61));

    let (_, outcome) = h.store.get_item_with_outcome("profile").await.unwrap();
    assert_eq!(outcome, Outcome::RemoteFailedFellBack);
    assert_eq!(
      h.store.get_item_with_outcome("profile").await.unwrap().1,
      Outcome::CircuitOpenSkipped
    );
  }

  #[tokio::test]
  async fn test_malformed_response_falls_back() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
      .mount(&server)
      .await;

    let h = harness(&server);
    h.store.local().set_item("waiting", &json!([7])).await.unwrap();

    let (value, outcome) = h.store.get_item_with_outcome("waiting").await.unwrap();
    assert_eq!(value, Some(json!([7])));
    assert_eq!(outcome, Outcome::RemoteFailedFellBack);
    assert_eq!(h.store.breaker().state().failure_count, 1);
  }

  #[tokio::test]
  async fn test_observer_sees_every_fallback() {
    let server = MockServer::start().await;
    mount_failing_remote(&server).await;

    let seen: Arc<Mutex<Vec<(String, FallbackReason)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let h = harness(&server);
    let store = h.store.with_observer(move |key: &str, reason: &FallbackReason| {
      sink.lock().unwrap().push((key.to_string(), reason.clone()));
    });

    for key in ["k1", "k2", "k3", "k4"] {
      store.set_item(key, &json!(1)).await.unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[0], ("k1".to_string(), FallbackReason::Remote(RemoteError::Status(500))));
    assert_eq!(seen[3], ("k4".to_string(), FallbackReason::CircuitOpen));
  }

  #[tokio::test]
  async fn test_observer_not_called_on_empty_remote_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
      .mount(&server)
      .await;

    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    let h = harness(&server);
    let store = h.store.with_observer(move |_: &str, _: &FallbackReason| {
      *counter.lock().unwrap() += 1;
    });

    assert_eq!(store.get_item("profile").await.unwrap(), None);
    assert_eq!(*calls.lock().unwrap(), 0);
  }

  struct BrokenLocal;

  #[async_trait]
  impl KeyValueStore for BrokenLocal {
    async fn get_item(&self, _key: &str) -> Result<Option<Value>> {
      Err(eyre!("quota exceeded"))
    }

    async fn set_item(&self, _key: &str, _value: &Value) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }

    async fn remove_item(&self, _key: &str) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }
  }

  #[tokio::test]
  async fn test_local_failure_propagates() {
    let server = MockServer::start().await;
    mount_failing_remote(&server).await;

    let h = harness_with(&server, BrokenLocal);
    let err = h.store.set_item("profile", &json!({})).await.unwrap_err();
    assert!(err.to_string().contains("quota exceeded"));
    assert!(h.store.get_item("profile").await.is_err());
  }

  #[tokio::test]
  async fn test_broken_local_unused_while_remote_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;

    let h = harness_with(&server, BrokenLocal);
    h.store.set_item("profile", &json!({})).await.unwrap();
    h.store.remove_item("profile").await.unwrap();
  }

  #[tokio::test]
  async fn test_concurrent_writes_same_key_last_writer_wins() {
    let server = MockServer::start().await;
    mount_failing_remote(&server).await;
    let h = harness(&server);

    let first = json!("first");
    let second = json!("second");
    let (a, b) = tokio::join!(
      h.store.set_item("cart", &first),
      h.store.set_item("cart", &second),
    );
    a.unwrap();
    b.unwrap();

    let value = h.store.get_item("cart").await.unwrap().unwrap();
    assert!(value == json!("first") || value == json!("second"));
  }

  #[tokio::test]
  async fn test_rehydrated_open_breaker_skips_remote() {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
      .respond_with(ResponseTemplate::new(200))
      .expect(0)
      .mount(&server)
      .await;

    let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    let store = Arc::new(MemoryStateStore::with_state(BreakerState {
      failure_count: 3,
      last_failure_timestamp: Some(now),
      is_closed: false,
    }));
    let breaker = Arc::new(CircuitBreaker::with_clock(
      BreakerConfig::default(),
      store,
      Arc::new(ManualClock::new(now)),
    ));
    let remote = RemoteStore::new(Url::parse(&server.uri()).unwrap(), Duration::from_millis(500), None)
      .unwrap();
    let adapter = ResilientStore::new(remote, MemoryStore::new(), breaker);

    adapter.set_item("profile", &json!({"balance": 5})).await.unwrap();
    assert_eq!(
      adapter.get_item("profile").await.unwrap(),
      Some(json!({"balance": 5}))
    );
    server.verify().await;
  }
}
