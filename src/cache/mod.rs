//! Expiry cache and persistent key-value storage.
//!
//! This module provides the resource-agnostic half of data sync:
//! - Durable key-value partitions (SQLite, or memory for tests)
//! - Per `(owner, endpoint)` expiry and ETag tracking
//! - A single-flight refresh queue fed by a background poller
//! - Longest-pattern dispatch to registered refresh callbacks

mod expiry;
mod queue;
mod storage;
mod traits;

pub use expiry::{EndpointExpiry, ExpiryCache, ExpiryConfig, RefreshRegistration, EXPIRY_PARTITION};
pub use queue::{expiry_key, normalize_endpoint, resolve_pattern, QueueEntry, RefreshCallback};
pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{KvRecord, KvStore, KvStoreExt};
