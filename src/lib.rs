//! Resilient key-value persistence for the DID storefront caches.
//!
//! [`ResilientStore`] writes to and reads from the remote KV worker while it is
//! healthy, and falls back to a local SQLite store whenever the remote fails or
//! the circuit breaker has it switched off.

pub mod adapter;
pub mod breaker;
pub mod config;
pub mod db;
pub mod logging;
pub mod persist;
pub mod store;

pub use adapter::{FallbackObserver, FallbackReason, Outcome, ResilientStore, TracingObserver};
pub use breaker::{BreakerState, CircuitBreaker};
pub use config::Config;
pub use persist::{Persistable, PersistedStore};
pub use store::{KeyValueStore, MemoryStore, RemoteStore, SqliteStore};
