//! Key-value storage backends: SQLite for durable use, memory for tests
//! and ephemeral runs.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{KvRecord, KvStore};
use crate::paths;

/// Storage that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  partitions: Mutex<HashMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, serde_json::Value>>>> {
    self
      .partitions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[async_trait]
impl KvStore for MemoryStorage {
  async fn get_all(&self, partition: &str) -> Result<Vec<KvRecord>> {
    let partitions = self.lock()?;
    Ok(
      partitions
        .get(partition)
        .map(|p| {
          p.iter()
            .map(|(k, v)| KvRecord::new(k.clone(), v.clone()))
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  async fn get(&self, partition: &str, key: &str) -> Result<Option<KvRecord>> {
    let partitions = self.lock()?;
    Ok(
      partitions
        .get(partition)
        .and_then(|p| p.get(key))
        .map(|v| KvRecord::new(key, v.clone())),
    )
  }

  async fn put(&self, partition: &str, record: KvRecord) -> Result<()> {
    let mut partitions = self.lock()?;
    partitions
      .entry(partition.to_string())
      .or_default()
      .insert(record.key, record.value);
    Ok(())
  }

  async fn delete(&self, partition: &str, key: &str) -> Result<()> {
    let mut partitions = self.lock()?;
    if let Some(p) = partitions.get_mut(partition) {
      p.remove(key);
    }
    Ok(())
  }

  async fn clear(&self, partition: &str) -> Result<()> {
    let mut partitions = self.lock()?;
    partitions.remove(partition);
    Ok(())
  }
}

/// SQLite-based key-value storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (creating if needed) the storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(paths::data_dir()?.join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    partition TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, key)
);
"#;

fn decode(key: String, data: &[u8]) -> Result<KvRecord> {
  let value = serde_json::from_slice(data)
    .map_err(|e| eyre!("Failed to deserialize record {}: {}", key, e))?;
  Ok(KvRecord { key, value })
}

#[async_trait]
impl KvStore for SqliteStorage {
  async fn get_all(&self, partition: &str) -> Result<Vec<KvRecord>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key, data FROM kv_store WHERE partition = ? ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map(params![partition], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query partition {}: {}", partition, e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| eyre!("Failed to read partition {}: {}", partition, e))?;

    rows
      .into_iter()
      .map(|(key, data)| decode(key, &data))
      .collect()
  }

  async fn get(&self, partition: &str, key: &str) -> Result<Option<KvRecord>> {
    let conn = self.lock()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM kv_store WHERE partition = ? AND key = ?",
        params![partition, key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read record {}: {}", key, e))?;

    data.map(|d| decode(key.to_string(), &d)).transpose()
  }

  async fn put(&self, partition: &str, record: KvRecord) -> Result<()> {
    let data = serde_json::to_vec(&record.value)
      .map_err(|e| eyre!("Failed to serialize record {}: {}", record.key, e))?;
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (partition, key, data, updated_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![partition, record.key, data],
      )
      .map_err(|e| eyre!("Failed to store record {}: {}", record.key, e))?;

    Ok(())
  }

  async fn delete(&self, partition: &str, key: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM kv_store WHERE partition = ? AND key = ?",
        params![partition, key],
      )
      .map_err(|e| eyre!("Failed to delete record {}: {}", key, e))?;

    Ok(())
  }

  async fn clear(&self, partition: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM kv_store WHERE partition = ?", params![partition])
      .map_err(|e| eyre!("Failed to clear partition {}: {}", partition, e))?;

    Ok(())
  }
}
