//! Expiry tracking and the background refresh scheduler.
//!
//! The cache records, per `(owner, endpoint)`, when fetched data goes
//! stale. A poller re-queues stale entries and a single drain loop runs
//! the refresh callback registered for each entry's endpoint pattern,
//! one entry at a time.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::{
  expiry_key, normalize_endpoint, split_expiry_key, PatternRegistry, QueueEntry, RefreshCallback,
  RefreshQueue,
};
use super::traits::{KvStore, KvStoreExt};
use crate::owner::{OwnerDirectory, OwnerFilter};

/// KV partition holding expiry entries.
pub const EXPIRY_PARTITION: &str = "expiry";

/// Cache boundary for one `(owner, endpoint)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointExpiry {
  #[serde(rename = "expiresAt", with = "chrono::serde::ts_milliseconds")]
  pub expires_at: DateTime<Utc>,
  pub etag: Option<String>,
}

/// Persisted shape of an expiry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExpiryRecord {
  key: String,
  #[serde(flatten)]
  expiry: EndpointExpiry,
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
  /// How often the poller scans for elapsed entries.
  pub poll_interval: std::time::Duration,
  /// Minimum cache window applied to empty results.
  pub empty_floor: Duration,
}

impl Default for ExpiryConfig {
  fn default() -> Self {
    Self {
      poll_interval: std::time::Duration::from_secs(60),
      empty_floor: Duration::hours(1),
    }
  }
}

#[derive(Default)]
struct ExpiryState {
  entries: HashMap<String, EndpointExpiry>,
  registry: PatternRegistry,
  queue: RefreshQueue,
  is_processing: bool,
  paused: bool,
  currently_refreshing: Option<QueueEntry>,
}

/// Storage mutation, applied by the writer task in send order.
enum WriteOp {
  Put(ExpiryRecord),
  Delete(String),
  Clear,
  Barrier(oneshot::Sender<()>),
}

/// Applies expiry writes one at a time so a delete can never be overtaken
/// by an earlier put for the same key.
async fn run_writer(storage: Arc<dyn KvStore>, mut ops: mpsc::UnboundedReceiver<WriteOp>) {
  while let Some(op) = ops.recv().await {
    match op {
      WriteOp::Put(record) => {
        if let Err(e) = storage.put_as(EXPIRY_PARTITION, &record.key, &record).await {
          warn!(key = %record.key, error = %e, "Failed to persist expiry");
        }
      }
      WriteOp::Delete(key) => {
        if let Err(e) = storage.delete(EXPIRY_PARTITION, &key).await {
          warn!(key = %key, error = %e, "Failed to delete expiry");
        }
      }
      WriteOp::Clear => {
        if let Err(e) = storage.clear(EXPIRY_PARTITION).await {
          warn!(error = %e, "Failed to clear persisted expiry entries");
        }
      }
      WriteOp::Barrier(done) => {
        let _ = done.send(());
      }
    }
  }
}

struct Inner {
  storage: Arc<dyn KvStore>,
  writer: mpsc::UnboundedSender<WriteOp>,
  owners: Arc<dyn OwnerDirectory>,
  config: ExpiryConfig,
  state: Mutex<ExpiryState>,
  initialized: tokio::sync::Mutex<bool>,
  poller: Mutex<Option<JoinHandle<()>>>,
  generation: AtomicU64,
  idle: Notify,
}

impl Drop for Inner {
  fn drop(&mut self) {
    let poller = self.poller.get_mut().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = poller.take() {
      handle.abort();
    }
  }
}

fn elapsed_entries(entries: &HashMap<String, EndpointExpiry>, now: DateTime<Utc>) -> Vec<QueueEntry> {
  entries
    .iter()
    .filter(|(_, expiry)| now >= expiry.expires_at)
    .filter_map(|(key, _)| split_expiry_key(key))
    .map(|(owner, endpoint)| QueueEntry::new(owner, endpoint))
    .collect()
}

/// Tracks expiry per `(owner, endpoint)` and drives background refreshes.
///
/// Cheap to clone; clones share state. Must be created inside a tokio
/// runtime: construction spawns the storage writer and queueing work
/// spawns the drain task.
#[derive(Clone)]
pub struct ExpiryCache {
  inner: Arc<Inner>,
}

/// Keeps a refresh callback registered. Dropping it unregisters.
#[must_use = "dropping the registration unregisters the callback"]
pub struct RefreshRegistration {
  cache: Weak<Inner>,
  id: u64,
}

impl RefreshRegistration {
  pub fn unregister(self) {}
}

impl Drop for RefreshRegistration {
  fn drop(&mut self) {
    if let Some(inner) = self.cache.upgrade() {
      ExpiryCache { inner }.lock().registry.unregister(self.id);
    }
  }
}

impl ExpiryCache {
  pub fn new(
    storage: Arc<dyn KvStore>,
    owners: Arc<dyn OwnerDirectory>,
    config: ExpiryConfig,
  ) -> Self {
    let (writer, ops) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(Arc::clone(&storage), ops));
    Self {
      inner: Arc::new(Inner {
        storage,
        writer,
        owners,
        config,
        state: Mutex::new(ExpiryState::default()),
        initialized: tokio::sync::Mutex::new(false),
        poller: Mutex::new(None),
        generation: AtomicU64::new(0),
        idle: Notify::new(),
      }),
    }
  }

  fn write(&self, op: WriteOp) {
    if self.inner.writer.send(op).is_err() {
      warn!("Expiry writer stopped, change not persisted");
    }
  }

  /// Wait until every write queued so far has been applied.
  async fn settle(&self) -> Result<()> {
    let (done, applied) = oneshot::channel();
    self
      .inner
      .writer
      .send(WriteOp::Barrier(done))
      .map_err(|_| eyre!("Expiry writer stopped"))?;
    applied
      .await
      .map_err(|_| eyre!("Expiry writer stopped before applying writes"))
  }

  fn lock(&self) -> MutexGuard<'_, ExpiryState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }

  /// Load persisted entries, start the poller and queue anything already
  /// expired. Concurrent and repeated calls perform the load once.
  pub async fn init(&self) {
    let mut initialized = self.inner.initialized.lock().await;
    if *initialized {
      return;
    }

    let records: Vec<ExpiryRecord> = match self.inner.storage.get_all_as(EXPIRY_PARTITION).await {
      Ok(records) => records,
      Err(e) => {
        error!(error = %e, "Failed to load expiry cache, starting empty");
        Vec::new()
      }
    };

    let now = Utc::now();
    let expired: Vec<QueueEntry> = {
      let mut state = self.lock();
      // Entries set since construction are newer than anything on disk
      for record in records {
        state.entries.entry(record.key).or_insert(record.expiry);
      }
      info!(entries = state.entries.len(), "Loaded expiry cache");
      elapsed_entries(&state.entries, now)
    };

    self.start_poller();
    *initialized = true;
    drop(initialized);

    if !expired.is_empty() {
      debug!(count = expired.len(), "Queueing entries expired at startup");
      self.enqueue_many(expired);
    }
  }

  /// Number of times the poller has been (re)started.
  pub fn poller_generation(&self) -> u64 {
    self.inner.generation.load(Ordering::SeqCst)
  }

  fn start_poller(&self) {
    self.inner.generation.fetch_add(1, Ordering::SeqCst);
    let weak = Arc::downgrade(&self.inner);
    let period = self.inner.config.poll_interval;
    let first_tick = tokio::time::Instant::now() + period;

    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval_at(first_tick, period);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        ExpiryCache { inner }.poll_expired();
      }
    });

    let mut poller = self
      .inner
      .poller
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = poller.replace(handle) {
      previous.abort();
    }
  }

  fn stop_poller(&self) {
    let mut poller = self
      .inner
      .poller
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = poller.take() {
      handle.abort();
    }
  }

  /// One poller tick: queue every elapsed entry not already pending.
  pub fn poll_expired(&self) {
    if self.is_paused() {
      return;
    }
    let now = Utc::now();
    let expired = elapsed_entries(&self.lock().entries, now);
    if !expired.is_empty() {
      debug!(count = expired.len(), "Poller found expired entries");
      self.enqueue_many(expired);
    }
  }

  /// Record a new expiry boundary. Empty results are held for at least
  /// the configured floor. Persistence happens in the background.
  pub fn set_expiry(
    &self,
    owner_key: &str,
    endpoint: &str,
    expires_at: DateTime<Utc>,
    etag: Option<String>,
    is_empty: bool,
  ) {
    let mut expires_at = expires_at;
    if is_empty {
      let floor = Utc::now() + self.inner.config.empty_floor;
      if expires_at < floor {
        expires_at = floor;
      }
    }

    let key = expiry_key(owner_key, endpoint);
    let expiry = EndpointExpiry { expires_at, etag };
    let mut state = self.lock();
    state.entries.insert(key.clone(), expiry.clone());
    // Queued under the lock so storage sees writes in memory order
    self.write(WriteOp::Put(ExpiryRecord { key, expiry }));
  }

  pub fn get_expiry(&self, owner_key: &str, endpoint: &str) -> Option<EndpointExpiry> {
    self
      .lock()
      .entries
      .get(&expiry_key(owner_key, endpoint))
      .cloned()
  }

  /// True when no entry exists or `now >= expires_at`.
  pub fn is_expired(&self, owner_key: &str, endpoint: &str) -> bool {
    self.is_expired_at(owner_key, endpoint, Utc::now())
  }

  pub fn is_expired_at(&self, owner_key: &str, endpoint: &str, now: DateTime<Utc>) -> bool {
    match self.get_expiry(owner_key, endpoint) {
      Some(expiry) => now >= expiry.expires_at,
      None => true,
    }
  }

  /// Snapshot of all expiry entries keyed by `"{owner}:{endpoint}"`.
  pub fn entries(&self) -> HashMap<String, EndpointExpiry> {
    self.lock().entries.clone()
  }

  /// Register a callback for endpoints containing `pattern`, applicable to
  /// owners matched by `scope`.
  pub fn register_refresh_callback<F, Fut>(
    &self,
    pattern: impl Into<String>,
    scope: OwnerFilter,
    callback: F,
  ) -> RefreshRegistration
  where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let callback: RefreshCallback = Arc::new(move |owner, endpoint| Box::pin(callback(owner, endpoint)));
    let pattern = pattern.into();
    debug!(pattern = %pattern, ?scope, "Registered refresh callback");
    let id = self.lock().registry.register(pattern, scope, callback);
    RefreshRegistration {
      cache: Arc::downgrade(&self.inner),
      id,
    }
  }

  /// Queue a refresh unless an equivalent entry is already pending.
  pub fn queue_refresh(&self, owner_key: &str, endpoint: &str) {
    self.enqueue_many(vec![QueueEntry::new(owner_key, endpoint)]);
  }

  /// Queue every registered pattern applicable to the owner.
  pub fn queue_all_endpoints_for_owner(&self, owner_key: &str) {
    let patterns = self.lock().registry.patterns_for(owner_key);
    let entries = patterns
      .into_iter()
      .map(|pattern| QueueEntry::new(owner_key, pattern))
      .collect();
    self.enqueue_many(entries);
  }

  /// Queue patterns for which an owner has no expiry entry yet.
  pub fn queue_missing_endpoints(&self, owner_keys: &[String]) {
    let entries = {
      let mut state = self.lock();
      let mut entries = Vec::new();
      for owner_key in owner_keys {
        let prefix = format!("{}:", owner_key);
        let known: Vec<String> = state
          .entries
          .keys()
          .filter_map(|k| k.strip_prefix(&prefix))
          .map(String::from)
          .collect();
        for pattern in state.registry.patterns_for(owner_key) {
          let normalized = normalize_endpoint(&pattern);
          let has_entry = known
            .iter()
            .any(|ep| ep.contains(pattern.as_str()) || ep.contains(normalized.as_str()));
          if !has_entry {
            entries.push(QueueEntry::new(owner_key.as_str(), pattern));
          }
        }
      }
      entries
    };
    if !entries.is_empty() {
      debug!(count = entries.len(), "Queueing endpoints with no expiry");
    }
    self.enqueue_many(entries);
  }

  fn enqueue_many(&self, entries: Vec<QueueEntry>) {
    {
      let mut state = self.lock();
      let ExpiryState {
        registry,
        queue,
        currently_refreshing,
        ..
      } = &mut *state;
      for entry in entries {
        if queue.push(registry, entry.clone(), currently_refreshing.as_ref()) {
          debug!(owner = %entry.owner_key, endpoint = %entry.endpoint, "Queued refresh");
        }
      }
    }
    self.process_queue();
  }

  /// Start the drain loop unless it is running or the cache is paused.
  fn process_queue(&self) {
    {
      let mut state = self.lock();
      if state.is_processing || state.paused || state.queue.is_empty() {
        return;
      }
      state.is_processing = true;
    }
    let this = self.clone();
    tokio::spawn(async move { this.drain().await });
  }

  async fn drain(&self) {
    let mut skipped: HashSet<String> = HashSet::new();

    loop {
      let (entry, callback) = {
        let mut state = self.lock();
        state.currently_refreshing = None;
        if state.paused {
          debug!("Refresh queue paused");
          state.is_processing = false;
          break;
        }
        let Some(entry) = state.queue.pop() else {
          state.is_processing = false;
          break;
        };
        if skipped.contains(&entry.owner_key) {
          continue;
        }
        if self.inner.owners.is_auth_failed(&entry.owner_key) {
          debug!(owner = %entry.owner_key, "Skipping owner with failed auth");
          skipped.insert(entry.owner_key);
          continue;
        }
        let Some(registration) = state.registry.find(&entry.endpoint) else {
          warn!(endpoint = %entry.endpoint, "No refresh callback registered");
          continue;
        };
        let callback = Arc::clone(&registration.callback);
        state.currently_refreshing = Some(entry.clone());
        (entry, callback)
      };

      debug!(owner = %entry.owner_key, endpoint = %entry.endpoint, "Refreshing");
      if let Err(e) = callback(entry.owner_key.clone(), entry.endpoint.clone()).await {
        error!(
          owner = %entry.owner_key,
          endpoint = %entry.endpoint,
          error = %e,
          "Refresh failed"
        );
      }
    }

    self.inner.idle.notify_waiters();
  }

  /// Resolves once the drain loop is not running.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.inner.idle.notified();
      if !self.lock().is_processing {
        return;
      }
      notified.await;
    }
  }

  /// Wait for every pending write to reach storage. Returns the number
  /// of entries held in memory.
  pub async fn flush(&self) -> Result<usize> {
    self.settle().await?;
    Ok(self.lock().entries.len())
  }

  /// Drop all expiry entries and queued work for an owner.
  pub async fn clear_for_owner(&self, owner_key: &str) -> usize {
    let prefix = format!("{}:", owner_key);
    let removed: Vec<String> = {
      let mut state = self.lock();
      state.queue.remove_owner(owner_key);
      let keys: Vec<String> = state
        .entries
        .keys()
        .filter(|k| k.starts_with(&prefix))
        .cloned()
        .collect();
      for key in &keys {
        state.entries.remove(key);
        self.write(WriteOp::Delete(key.clone()));
      }
      keys
    };

    if let Err(e) = self.settle().await {
      warn!(owner = %owner_key, error = %e, "Expiry deletes not confirmed");
    }
    if !removed.is_empty() {
      info!(owner = %owner_key, count = removed.len(), "Cleared expiry entries");
    }
    removed.len()
  }

  /// Remove entries whose owner is no longer known. Returns the count.
  pub async fn prune_orphaned(&self) -> usize {
    let known: HashSet<String> = self
      .inner
      .owners
      .owners()
      .iter()
      .map(|o| o.key())
      .collect();

    let orphaned: Vec<String> = {
      let mut state = self.lock();
      let keys: Vec<String> = state
        .entries
        .keys()
        .filter(|k| match split_expiry_key(k) {
          Some((owner, _)) => !known.contains(owner),
          None => true,
        })
        .cloned()
        .collect();
      for key in &keys {
        state.entries.remove(key);
        self.write(WriteOp::Delete(key.clone()));
      }
      keys
    };

    if let Err(e) = self.settle().await {
      warn!(error = %e, "Orphaned expiry deletes not confirmed");
    }
    if !orphaned.is_empty() {
      info!(count = orphaned.len(), "Pruned orphaned expiry entries");
    }
    orphaned.len()
  }

  /// Stop draining and stop the poller from queueing. Queued work is kept
  /// and an in-flight callback runs to completion.
  pub fn pause(&self) {
    self.lock().paused = true;
    info!("Refresh queue paused");
  }

  pub fn resume(&self) {
    self.lock().paused = false;
    info!("Refresh queue resumed");
    self.process_queue();
  }

  pub fn is_paused(&self) -> bool {
    self.lock().paused
  }

  pub fn is_processing(&self) -> bool {
    self.lock().is_processing
  }

  pub fn currently_refreshing(&self) -> Option<QueueEntry> {
    self.lock().currently_refreshing.clone()
  }

  pub fn queued(&self) -> Vec<QueueEntry> {
    self.lock().queue.snapshot()
  }

  /// Wipe persisted and in-memory state and stop the poller. Callback
  /// registrations survive; the next `init` starts from scratch.
  pub async fn clear(&self) {
    let mut initialized = self.inner.initialized.lock().await;
    self.stop_poller();
    {
      let mut state = self.lock();
      state.entries.clear();
      state.queue.clear();
      self.write(WriteOp::Clear);
    }
    if let Err(e) = self.settle().await {
      warn!(error = %e, "Expiry clear not confirmed");
    }
    *initialized = false;
    info!("Expiry cache cleared");
  }

  /// Stop background work and drop every registration.
  pub fn dispose(&self) {
    self.stop_poller();
    let mut state = self.lock();
    state.queue.clear();
    state.registry.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::traits::KvRecord;
  use crate::owner::{Owner, OwnerSet};
  use async_trait::async_trait;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::oneshot;

  struct CountingStorage {
    inner: MemoryStorage,
    loads: AtomicUsize,
  }

  #[async_trait]
  impl KvStore for CountingStorage {
    async fn get_all(&self, partition: &str) -> Result<Vec<KvRecord>> {
      self.loads.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(std::time::Duration::from_millis(20)).await;
      self.inner.get_all(partition).await
    }
    async fn get(&self, partition: &str, key: &str) -> Result<Option<KvRecord>> {
      self.inner.get(partition, key).await
    }
    async fn put(&self, partition: &str, record: KvRecord) -> Result<()> {
      self.inner.put(partition, record).await
    }
    async fn delete(&self, partition: &str, key: &str) -> Result<()> {
      self.inner.delete(partition, key).await
    }
    async fn clear(&self, partition: &str) -> Result<()> {
      self.inner.clear(partition).await
    }
  }

  fn owners() -> Arc<OwnerSet> {
    Arc::new(OwnerSet::new(vec![
      Owner::character(100, "Pilot"),
      Owner::corporation(200, "Corp", 100),
    ]))
  }

  fn cache_with(storage: Arc<dyn KvStore>, owners: Arc<OwnerSet>) -> ExpiryCache {
    ExpiryCache::new(storage, owners, ExpiryConfig::default())
  }

  type Calls = Arc<Mutex<Vec<QueueEntry>>>;

  fn recorder(cache: &ExpiryCache, pattern: &str) -> (RefreshRegistration, Calls) {
    scoped_recorder(cache, pattern, OwnerFilter::All)
  }

  fn scoped_recorder(
    cache: &ExpiryCache,
    pattern: &str,
    scope: OwnerFilter,
  ) -> (RefreshRegistration, Calls) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let registration = cache.register_refresh_callback(pattern, scope, move |owner, endpoint| {
      let sink = Arc::clone(&sink);
      async move {
        sink.lock().unwrap().push(QueueEntry::new(owner, endpoint));
        Ok(())
      }
    });
    (registration, calls)
  }

  #[tokio::test]
  async fn test_concurrent_init_loads_once() {
    let storage = Arc::new(CountingStorage {
      inner: MemoryStorage::new(),
      loads: AtomicUsize::new(0),
    });
    let cache = cache_with(storage.clone(), owners());

    tokio::join!(cache.init(), cache.init());
    cache.init().await;

    assert_eq!(storage.loads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.poller_generation(), 1);
  }

  #[tokio::test]
  async fn test_staleness_boundary() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let t = Utc::now() + Duration::minutes(10);
    cache.set_expiry("character-100", "/characters/100/clones/", t, None, false);

    assert!(!cache.is_expired_at("character-100", "/characters/100/clones", t - Duration::milliseconds(1)));
    assert!(cache.is_expired_at("character-100", "/characters/100/clones", t));
    assert!(cache.is_expired_at("character-100", "/characters/100/clones", t + Duration::seconds(1)));
    assert!(!cache.is_expired("character-100", "/characters/100/clones"));
    // Unknown entries are expired
    assert!(cache.is_expired("character-100", "/characters/100/mail"));
  }

  #[tokio::test]
  async fn test_empty_result_floor() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let now = Utc::now();
    cache.set_expiry(
      "character-100",
      "/characters/100/mail",
      now + Duration::seconds(5),
      None,
      true,
    );
    let expiry = cache.get_expiry("character-100", "/characters/100/mail").unwrap();
    assert!(expiry.expires_at >= now + Duration::hours(1));

    // Non-empty results keep the server window
    cache.set_expiry(
      "character-100",
      "/characters/100/wallet",
      now + Duration::seconds(5),
      Some("\"abc\"".into()),
      false,
    );
    let expiry = cache.get_expiry("character-100", "/characters/100/wallet").unwrap();
    assert_eq!(expiry.expires_at, now + Duration::seconds(5));
    assert_eq!(expiry.etag.as_deref(), Some("\"abc\""));
  }

  #[tokio::test]
  async fn test_set_expiry_persists_and_reloads() {
    let storage: Arc<dyn KvStore> = Arc::new(MemoryStorage::new());
    let cache = cache_with(Arc::clone(&storage), owners());
    let t = Utc::now() + Duration::minutes(30);
    cache.set_expiry("character-100", "/characters/100/clones", t, Some("e1".into()), false);
    cache.flush().await.unwrap();

    let reloaded = cache_with(storage, owners());
    reloaded.init().await;
    let expiry = reloaded.get_expiry("character-100", "/characters/100/clones").unwrap();
    assert_eq!(expiry.expires_at.timestamp_millis(), t.timestamp_millis());
    assert_eq!(expiry.etag.as_deref(), Some("e1"));
  }

  #[tokio::test]
  async fn test_flush_writes_all_entries() {
    let storage: Arc<dyn KvStore> = Arc::new(MemoryStorage::new());
    let cache = cache_with(Arc::clone(&storage), owners());
    let t = Utc::now() + Duration::minutes(30);
    cache.set_expiry("character-100", "/characters/100/clones", t, None, false);
    cache.set_expiry("character-100", "/characters/100/assets", t, None, false);

    assert_eq!(cache.flush().await.unwrap(), 2);
    assert_eq!(storage.get_all(EXPIRY_PARTITION).await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_duplicate_queue_suppression() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let (_reg, calls) = recorder(&cache, "/clones");
    cache.pause();

    cache.queue_refresh("character-100", "/characters/100/clones");
    cache.queue_refresh("character-100", "/characters/100/clones/?page=2");
    assert_eq!(cache.queued().len(), 1);

    cache.resume();
    cache.wait_idle().await;
    assert_eq!(calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_longest_pattern_callback_runs() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let (_short, short_calls) = recorder(&cache, "/structures");
    let (_long, long_calls) = recorder(&cache, "/corporations/structures/detail");

    cache.queue_refresh("corporation-200", "/corporations/structures/detail/structures");
    cache.wait_idle().await;

    assert_eq!(long_calls.lock().unwrap().len(), 1);
    assert!(short_calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_queue_missing_endpoints_invokes_callback_once() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let (_reg, calls) = scoped_recorder(&cache, "/clones", OwnerFilter::Character);
    let (_corp_reg, corp_calls) = scoped_recorder(&cache, "/structures", OwnerFilter::Corporation);

    cache.queue_missing_endpoints(&["character-100".to_string()]);
    cache.wait_idle().await;

    assert_eq!(
      *calls.lock().unwrap(),
      vec![QueueEntry::new("character-100", "/clones")]
    );
    // Corporation-only patterns are never queued for characters
    assert!(corp_calls.lock().unwrap().is_empty());

    // Once an expiry exists the endpoint is no longer missing
    cache.set_expiry(
      "character-100",
      "/characters/100/clones/",
      Utc::now() + Duration::minutes(5),
      None,
      false,
    );
    cache.queue_missing_endpoints(&["character-100".to_string()]);
    cache.wait_idle().await;
    assert_eq!(calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_queue_all_endpoints_for_owner() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    cache.pause();
    let (_a, _) = recorder(&cache, "/blueprints");
    let _b = cache.register_refresh_callback("/clones", OwnerFilter::Character, |_, _| async { Ok(()) });
    let _c = cache.register_refresh_callback("/structures", OwnerFilter::Corporation, |_, _| async {
      Ok(())
    });

    cache.queue_all_endpoints_for_owner("corporation-200");
    let mut endpoints: Vec<String> = cache.queued().into_iter().map(|e| e.endpoint).collect();
    endpoints.sort();
    assert_eq!(endpoints, vec!["/blueprints", "/structures"]);
  }

  #[tokio::test]
  async fn test_failing_callback_does_not_halt_queue() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let _bad = cache.register_refresh_callback("/mail", OwnerFilter::All, |_, _| async {
      Err(color_eyre::eyre::eyre!("boom"))
    });
    let (_good, calls) = recorder(&cache, "/clones");

    cache.pause();
    cache.queue_refresh("character-100", "/characters/100/mail");
    cache.queue_refresh("character-100", "/characters/100/clones");
    cache.resume();
    cache.wait_idle().await;

    assert_eq!(calls.lock().unwrap().len(), 1);
    assert!(cache.queued().is_empty());
  }

  #[tokio::test]
  async fn test_auth_failed_owner_skipped() {
    let owners = owners();
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners.clone());
    let (_reg, calls) = recorder(&cache, "/clones");
    let (_reg2, asset_calls) = recorder(&cache, "/assets");

    cache.pause();
    cache.queue_refresh("character-100", "/characters/100/clones");
    cache.queue_refresh("character-100", "/characters/100/assets");
    owners.set_auth_failed("character-100", true);
    cache.resume();
    cache.wait_idle().await;

    assert!(calls.lock().unwrap().is_empty());
    assert!(asset_calls.lock().unwrap().is_empty());
    assert!(cache.queued().is_empty());
  }

  #[tokio::test]
  async fn test_pause_mid_flight_then_resume() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let started = Arc::new(Mutex::new(Some(started_tx)));
    let release = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
    let slow_calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&slow_calls);
    let _slow = cache.register_refresh_callback("/clones", OwnerFilter::All, move |_, _| {
      let started = Arc::clone(&started);
      let release = Arc::clone(&release);
      let counter = Arc::clone(&counter);
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = started.lock().unwrap().take() {
          let _ = tx.send(());
        }
        if let Some(rx) = release.lock().await.take() {
          let _ = rx.await;
        }
        Ok(())
      }
    });
    let (_fast, fast_calls) = recorder(&cache, "/assets");

    cache.queue_refresh("character-100", "/characters/100/clones");
    cache.queue_refresh("character-100", "/characters/100/assets");
    started_rx.await.unwrap();

    cache.pause();
    release_tx.send(()).unwrap();
    cache.wait_idle().await;

    assert_eq!(slow_calls.load(Ordering::SeqCst), 1);
    assert!(fast_calls.lock().unwrap().is_empty());
    assert_eq!(cache.queued().len(), 1);

    cache.resume();
    cache.wait_idle().await;
    assert_eq!(fast_calls.lock().unwrap().len(), 1);
    assert_eq!(slow_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_init_queues_expired_entries() {
    let storage: Arc<dyn KvStore> = Arc::new(MemoryStorage::new());
    storage
      .put_as(
        EXPIRY_PARTITION,
        "character-100:/characters/100/clones",
        &ExpiryRecord {
          key: "character-100:/characters/100/clones".into(),
          expiry: EndpointExpiry {
            expires_at: Utc::now() - Duration::minutes(1),
            etag: None,
          },
        },
      )
      .await
      .unwrap();

    let cache = cache_with(storage, owners());
    let (_reg, calls) = recorder(&cache, "/clones");
    cache.init().await;
    cache.wait_idle().await;

    assert_eq!(
      *calls.lock().unwrap(),
      vec![QueueEntry::new("character-100", "/characters/100/clones")]
    );
  }

  #[tokio::test]
  async fn test_poll_expired_respects_pause() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let (_reg, calls) = recorder(&cache, "/clones");
    cache.set_expiry(
      "character-100",
      "/characters/100/clones",
      Utc::now() - Duration::seconds(1),
      None,
      false,
    );

    cache.pause();
    cache.poll_expired();
    assert!(cache.queued().is_empty());

    cache.resume();
    cache.poll_expired();
    cache.wait_idle().await;
    assert_eq!(calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_clear_for_owner_and_prune() {
    let storage: Arc<dyn KvStore> = Arc::new(MemoryStorage::new());
    let owners = owners();
    let cache = cache_with(Arc::clone(&storage), owners.clone());
    let later = Utc::now() + Duration::hours(1);
    cache.set_expiry("character-100", "/characters/100/clones", later, None, false);
    cache.set_expiry("character-100", "/characters/100/assets", later, None, false);
    cache.set_expiry("character-1000", "/characters/1000/assets", later, None, false);
    cache.set_expiry("corporation-200", "/corporations/200/structures", later, None, false);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // "character-1000" shares a prefix with "character-100" but is distinct
    assert_eq!(cache.clear_for_owner("character-100").await, 2);
    assert_eq!(cache.clear_for_owner("character-100").await, 0);
    assert!(cache.get_expiry("character-1000", "/characters/1000/assets").is_some());

    owners.remove("corporation-200");
    assert_eq!(cache.prune_orphaned().await, 2);
    assert!(cache.entries().is_empty());
    assert!(storage.get_all(EXPIRY_PARTITION).await.unwrap().is_empty());
  }

  /// Storage whose puts land late, to expose write ordering.
  struct SlowPuts {
    inner: MemoryStorage,
  }

  #[async_trait]
  impl KvStore for SlowPuts {
    async fn get_all(&self, partition: &str) -> Result<Vec<KvRecord>> {
      self.inner.get_all(partition).await
    }
    async fn get(&self, partition: &str, key: &str) -> Result<Option<KvRecord>> {
      self.inner.get(partition, key).await
    }
    async fn put(&self, partition: &str, record: KvRecord) -> Result<()> {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
      self.inner.put(partition, record).await
    }
    async fn delete(&self, partition: &str, key: &str) -> Result<()> {
      self.inner.delete(partition, key).await
    }
    async fn clear(&self, partition: &str) -> Result<()> {
      self.inner.clear(partition).await
    }
  }

  #[tokio::test]
  async fn test_clear_for_owner_right_after_set_stays_deleted() {
    let storage: Arc<dyn KvStore> = Arc::new(SlowPuts {
      inner: MemoryStorage::new(),
    });
    let cache = cache_with(Arc::clone(&storage), owners());
    let later = Utc::now() + Duration::hours(1);
    cache.set_expiry("character-100", "/characters/100/clones", later, None, false);

    assert_eq!(cache.clear_for_owner("character-100").await, 1);
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(storage.get_all(EXPIRY_PARTITION).await.unwrap().is_empty());

    let reloaded = cache_with(storage, owners());
    reloaded.init().await;
    assert!(reloaded.entries().is_empty());
  }

  #[tokio::test]
  async fn test_clear_right_after_set_stays_cleared() {
    let storage: Arc<dyn KvStore> = Arc::new(SlowPuts {
      inner: MemoryStorage::new(),
    });
    let cache = cache_with(Arc::clone(&storage), owners());
    let later = Utc::now() + Duration::hours(1);
    cache.set_expiry("character-100", "/characters/100/clones", later, None, false);
    cache.set_expiry("corporation-200", "/corporations/200/structures", later, None, false);

    cache.clear().await;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(storage.get_all(EXPIRY_PARTITION).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_init_keeps_newer_in_memory_entry() {
    let storage: Arc<dyn KvStore> = Arc::new(MemoryStorage::new());
    let old = Utc::now() + Duration::minutes(1);
    let first = cache_with(Arc::clone(&storage), owners());
    first.set_expiry("character-100", "/characters/100/clones", old, Some("old".into()), false);
    first.flush().await.unwrap();

    let newer = Utc::now() + Duration::hours(2);
    let cache = cache_with(storage, owners());
    cache.set_expiry("character-100", "/characters/100/clones", newer, Some("new".into()), false);
    cache.init().await;

    let expiry = cache.get_expiry("character-100", "/characters/100/clones").unwrap();
    assert_eq!(expiry.expires_at, newer);
    assert_eq!(expiry.etag.as_deref(), Some("new"));
  }

  async fn run_pending_tasks() {
    for _ in 0..20 {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_poller_fires_on_interval() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let (_reg, calls) = recorder(&cache, "/clones");
    cache.init().await;
    cache.set_expiry(
      "character-100",
      "/characters/100/clones",
      Utc::now() - Duration::seconds(1),
      None,
      false,
    );

    tokio::time::advance(std::time::Duration::from_secs(30)).await;
    run_pending_tasks().await;
    assert!(calls.lock().unwrap().is_empty());

    tokio::time::advance(std::time::Duration::from_secs(31)).await;
    run_pending_tasks().await;
    cache.wait_idle().await;
    assert_eq!(
      *calls.lock().unwrap(),
      vec![QueueEntry::new("character-100", "/characters/100/clones")]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_reinit_after_clear_replaces_poller() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let (_reg, calls) = recorder(&cache, "/clones");
    // First poller would tick at 60s
    cache.init().await;
    run_pending_tasks().await;

    tokio::time::advance(std::time::Duration::from_secs(30)).await;
    cache.clear().await;
    // Second poller ticks at 90s
    cache.init().await;
    run_pending_tasks().await;
    assert_eq!(cache.poller_generation(), 2);

    cache.set_expiry(
      "character-100",
      "/characters/100/clones",
      Utc::now() - Duration::seconds(1),
      None,
      false,
    );
    tokio::time::advance(std::time::Duration::from_secs(31)).await;
    run_pending_tasks().await;
    assert!(calls.lock().unwrap().is_empty());

    tokio::time::advance(std::time::Duration::from_secs(30)).await;
    run_pending_tasks().await;
    cache.wait_idle().await;
    assert_eq!(calls.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_dropped_cache_releases_state() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    cache.init().await;
    let (_reg, _calls) = recorder(&cache, "/clones");
    let weak = Arc::downgrade(&cache.inner);

    drop(cache);
    assert!(weak.upgrade().is_none());
  }

  #[tokio::test]
  async fn test_registration_drop_unregisters() {
    let cache = cache_with(Arc::new(MemoryStorage::new()), owners());
    let (reg, calls) = recorder(&cache, "/clones");
    reg.unregister();

    cache.queue_refresh("character-100", "/characters/100/clones");
    cache.wait_idle().await;
    assert!(calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_clear_resets_init() {
    let storage = Arc::new(CountingStorage {
      inner: MemoryStorage::new(),
      loads: AtomicUsize::new(0),
    });
    let cache = cache_with(storage.clone(), owners());
    cache.init().await;
    cache.set_expiry("character-100", "/x", Utc::now() + Duration::hours(1), None, false);

    cache.clear().await;
    assert!(cache.entries().is_empty());

    cache.init().await;
    assert_eq!(storage.loads.load(Ordering::SeqCst), 2);
    assert_eq!(cache.poller_generation(), 2);
  }
}
