//! Core traits and types for the persistent key-value layer.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

/// A single stored record: a key plus its JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct KvRecord {
  pub key: String,
  pub value: Value,
}

impl KvRecord {
  pub fn new(key: impl Into<String>, value: Value) -> Self {
    Self {
      key: key.into(),
      value,
    }
  }
}

/// Durable key-value storage scoped into named partitions.
///
/// Writes are overwrite-by-key; no operation spans more than one key
/// except `clear`.
#[async_trait]
pub trait KvStore: Send + Sync {
  /// All records in a partition.
  async fn get_all(&self, partition: &str) -> Result<Vec<KvRecord>>;

  /// A single record by key.
  async fn get(&self, partition: &str, key: &str) -> Result<Option<KvRecord>>;

  /// Insert or overwrite a record.
  async fn put(&self, partition: &str, record: KvRecord) -> Result<()>;

  /// Delete a record. Deleting a missing key is not an error.
  async fn delete(&self, partition: &str, key: &str) -> Result<()>;

  /// Remove every record in a partition.
  async fn clear(&self, partition: &str) -> Result<()>;
}

/// Typed helpers over [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
  /// Decode every record in a partition, skipping rows that no longer
  /// match `T`.
  async fn get_all_as<T: DeserializeOwned + Send>(&self, partition: &str) -> Result<Vec<T>> {
    let records = self.get_all(partition).await?;
    let mut decoded = Vec::with_capacity(records.len());
    for record in records {
      match serde_json::from_value(record.value) {
        Ok(value) => decoded.push(value),
        Err(e) => warn!(partition, key = %record.key, error = %e, "Skipping undecodable record"),
      }
    }
    Ok(decoded)
  }

  async fn put_as<T: Serialize + Sync>(&self, partition: &str, key: &str, value: &T) -> Result<()> {
    let value =
      serde_json::to_value(value).map_err(|e| eyre!("Failed to serialize record {}: {}", key, e))?;
    self.put(partition, KvRecord::new(key, value)).await
  }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}
