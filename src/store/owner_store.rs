use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::source::{OwnerData, OwnerDataSource};
use crate::cache::{ExpiryCache, KvStore, KvStoreExt, RefreshRegistration};
use crate::owner::{owner_key, Owner, OwnerDirectory, OwnerType};

/// Snapshot of a store, published to subscribers on every change.
#[derive(Debug, Clone)]
pub struct StoreState<T, D> {
  pub data_by_owner: Vec<OwnerData<T>>,
  pub is_updating: bool,
  /// Set only when a batch update produced nothing for any owner.
  pub update_error: Option<String>,
  pub initialized: bool,
  pub derived: D,
}

impl<T, D: Default> Default for StoreState<T, D> {
  fn default() -> Self {
    Self {
      data_by_owner: Vec::new(),
      is_updating: false,
      update_error: None,
      initialized: false,
      derived: D::default(),
    }
  }
}

/// Persisted shape of one owner's data.
#[derive(Deserialize)]
struct OwnerRecord<T> {
  #[allow(dead_code)]
  key: String,
  owner: Owner,
  data: T,
}

#[derive(Serialize)]
struct OwnerRecordRef<'a, T> {
  key: &'a str,
  owner: &'a Owner,
  data: &'a T,
}

type Snapshot<S> =
  Arc<StoreState<<S as OwnerDataSource>::Data, <S as OwnerDataSource>::Derived>>;

/// Fetches, persists and tracks one resource for every applicable owner.
pub struct OwnerStore<S: OwnerDataSource> {
  source: S,
  cache: ExpiryCache,
  storage: Arc<dyn KvStore>,
  owners: Arc<dyn OwnerDirectory>,
  state: watch::Sender<Snapshot<S>>,
  init_lock: tokio::sync::Mutex<()>,
  _registration: RefreshRegistration,
}

impl<S: OwnerDataSource> OwnerStore<S> {
  /// Create the store and register its refresh callback with `cache`.
  pub fn new(
    source: S,
    cache: ExpiryCache,
    storage: Arc<dyn KvStore>,
    owners: Arc<dyn OwnerDirectory>,
  ) -> Arc<Self> {
    Arc::new_cyclic(|weak: &Weak<Self>| {
      let weak = weak.clone();
      let registration = cache.register_refresh_callback(
        source.endpoint_pattern(),
        source.owner_filter(),
        move |owner_key, _endpoint| {
          let weak = weak.clone();
          async move {
            match weak.upgrade() {
              Some(store) => store.refresh_owner_key(&owner_key).await,
              None => Ok(()),
            }
          }
        },
      );
      let (state, _) = watch::channel(Arc::new(StoreState::default()));

      Self {
        source,
        cache,
        storage,
        owners,
        state,
        init_lock: tokio::sync::Mutex::new(()),
        _registration: registration,
      }
    })
  }

  pub fn name(&self) -> &str {
    self.source.name()
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Current state.
  pub fn snapshot(&self) -> Snapshot<S> {
    Arc::clone(&self.state.borrow())
  }

  /// Receive every future state change.
  pub fn subscribe(&self) -> watch::Receiver<Snapshot<S>> {
    self.state.subscribe()
  }

  pub fn data_for_owner(&self, key: &str) -> Option<OwnerData<S::Data>> {
    self
      .state
      .borrow()
      .data_by_owner
      .iter()
      .find(|d| d.key() == key)
      .cloned()
  }

  /// Load persisted records. Idempotent; load failures leave the store
  /// empty but usable.
  pub async fn init(&self) {
    let _guard = self.init_lock.lock().await;
    let initialized = self.state.borrow().initialized;
    if initialized {
      return;
    }

    let records: Vec<OwnerRecord<S::Data>> = match self.storage.get_all_as(self.name()).await {
      Ok(records) => records,
      Err(e) => {
        error!(store = self.name(), error = %e, "Failed to load cached data");
        Vec::new()
      }
    };

    let data: Vec<OwnerData<S::Data>> = records
      .into_iter()
      .map(|r| self.source.to_owner_data(r.owner, r.data))
      .collect();
    info!(store = self.name(), owners = data.len(), "Loaded cached data");

    let derived = self.source.derive(&data);
    self.state.send_modify(|state| {
      let state = Arc::make_mut(state);
      state.data_by_owner = data;
      state.derived = derived;
      state.initialized = true;
    });
  }

  /// Refresh every applicable owner, or only stale ones unless `force`.
  ///
  /// Owners are fetched one after another. A failing owner keeps its
  /// previous data; `update_error` is set only if every owner failed.
  pub async fn update(&self, force: bool) {
    let is_updating = self.state.borrow().is_updating;
    if is_updating {
      return;
    }

    let filter = self.source.owner_filter();
    let candidates: Vec<Owner> = self
      .owners
      .owners()
      .into_iter()
      .filter(|o| filter.matches(o.owner_type) && !o.auth_failed)
      .filter(|o| force || self.cache.is_expired(&o.key(), &self.source.endpoint(o)))
      .collect();
    if candidates.is_empty() {
      return;
    }

    let started = self.state.send_if_modified(|state| {
      if state.is_updating {
        return false;
      }
      let state = Arc::make_mut(state);
      state.is_updating = true;
      state.update_error = None;
      true
    });
    if !started {
      return;
    }

    debug!(store = self.name(), owners = candidates.len(), force, "Updating");
    let mut succeeded = 0usize;
    for owner in &candidates {
      match self.fetch_and_store(owner).await {
        Ok(_) => succeeded += 1,
        Err(e) => warn!(store = self.name(), owner = %owner.key(), error = %e, "Fetch failed"),
      }
    }

    let update_error = (succeeded == 0).then(|| {
      format!(
        "Failed to update {} for {} owner(s)",
        self.name(),
        candidates.len()
      )
    });
    if let Some(message) = &update_error {
      error!(store = self.name(), "{}", message);
    }

    self.state.send_modify(|state| {
      let state = Arc::make_mut(state);
      state.is_updating = false;
      state.update_error = update_error;
    });

    let snapshot = self.snapshot();
    self
      .source
      .after_batch_update(&snapshot.data_by_owner)
      .await;
  }

  /// Refresh a single owner, independent of any batch update.
  pub async fn update_for_owner(&self, owner: &Owner) -> Result<()> {
    let previous = self.data_for_owner(&owner.key());
    self.source.before_owner_update(owner, previous.as_ref()).await;

    let current = self.fetch_and_store(owner).await?;

    self
      .source
      .after_owner_update(owner, previous.as_ref(), &current)
      .await;
    Ok(())
  }

  /// Refresh callback entry point.
  async fn refresh_owner_key(&self, key: &str) -> Result<()> {
    let Some(owner) = self.owners.find(key) else {
      debug!(store = self.name(), owner = %key, "Owner no longer exists");
      return Ok(());
    };
    if !self.source.owner_filter().matches(owner.owner_type) {
      return Err(eyre!("{} does not apply to {}", self.name(), key));
    }
    self.update_for_owner(&owner).await
  }

  async fn fetch_and_store(&self, owner: &Owner) -> Result<OwnerData<S::Data>> {
    let key = owner.key();
    let endpoint = self.source.endpoint(owner);

    let response = self.source.fetch_data(owner).await?;
    let is_empty = self.source.is_empty(&response.data);
    let owner_data = self.source.to_owner_data(owner.clone(), response.data);

    let record = OwnerRecordRef {
      key: &key,
      owner: &owner_data.owner,
      data: &owner_data.data,
    };
    if let Err(e) = self.storage.put_as(self.name(), &key, &record).await {
      warn!(store = self.name(), owner = %key, error = %e, "Failed to persist data");
    }

    self.merge(owner_data.clone());
    self
      .cache
      .set_expiry(&key, &endpoint, response.expires_at, response.etag, is_empty);

    Ok(owner_data)
  }

  fn merge(&self, owner_data: OwnerData<S::Data>) {
    self.state.send_modify(|state| {
      let state = Arc::make_mut(state);
      let key = owner_data.key();
      match state.data_by_owner.iter_mut().find(|d| d.key() == key) {
        Some(existing) => *existing = owner_data,
        None => state.data_by_owner.push(owner_data),
      }
      state.derived = self.source.derive(&state.data_by_owner);
    });
  }

  /// Forget an owner: persisted record, in-memory data and all its expiry
  /// state. Repeated calls are no-ops.
  pub async fn remove_for_owner(&self, owner_type: OwnerType, id: u64) {
    let key = owner_key(owner_type, id);

    if let Err(e) = self.storage.delete(self.name(), &key).await {
      warn!(store = self.name(), owner = %key, error = %e, "Failed to delete data");
    }

    self.state.send_if_modified(|state| {
      if !state.data_by_owner.iter().any(|d| d.key() == key) {
        return false;
      }
      let state = Arc::make_mut(state);
      state.data_by_owner.retain(|d| d.key() != key);
      state.derived = self.source.derive(&state.data_by_owner);
      true
    });

    self.cache.clear_for_owner(&key).await;
  }

  /// Wipe the partition and reset to an empty, uninitialized store.
  pub async fn clear(&self) {
    let _guard = self.init_lock.lock().await;
    if let Err(e) = self.storage.clear(self.name()).await {
      warn!(store = self.name(), error = %e, "Failed to clear stored data");
    }
    self.state.send_replace(Arc::new(StoreState::default()));
    info!(store = self.name(), "Cleared");
  }
}

/// Point-in-time counts for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSummary {
  pub name: String,
  pub owners: usize,
  pub update_error: Option<String>,
}

/// Type-erased store handle, so differently typed stores can be driven
/// as one collection.
#[async_trait]
pub trait SyncedStore: Send + Sync {
  fn store_name(&self) -> &str;
  async fn init(&self);
  async fn update(&self, force: bool);
  async fn remove_for_owner(&self, owner_type: OwnerType, id: u64);
  async fn clear(&self);
  fn summary(&self) -> StoreSummary;
}

#[async_trait]
impl<S: OwnerDataSource> SyncedStore for OwnerStore<S> {
  fn store_name(&self) -> &str {
    self.name()
  }

  async fn init(&self) {
    OwnerStore::init(self).await
  }

  async fn update(&self, force: bool) {
    OwnerStore::update(self, force).await
  }

  async fn remove_for_owner(&self, owner_type: OwnerType, id: u64) {
    OwnerStore::remove_for_owner(self, owner_type, id).await
  }

  async fn clear(&self) {
    OwnerStore::clear(self).await
  }

  fn summary(&self) -> StoreSummary {
    let state = self.snapshot();
    StoreSummary {
      name: self.name().to_string(),
      owners: state.data_by_owner.len(),
      update_error: state.update_error.clone(),
    }
  }
}
