//! Per-resource configuration consumed by [`OwnerStore`](super::OwnerStore).

use async_trait::async_trait;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::esi::FetchResponse;
use crate::owner::{Owner, OwnerFilter};

/// One owner's copy of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerData<T> {
  pub owner: Owner,
  pub data: T,
}

impl<T> OwnerData<T> {
  pub fn key(&self) -> String {
    self.owner.key()
  }
}

/// Describes how to fetch, persist and index one kind of owner data.
///
/// Only the fetch side is required; everything else has a sensible
/// default. `Derived` is aggregate state rebuilt from all owners' data;
/// use `()` when a resource has none.
#[async_trait]
pub trait OwnerDataSource: Send + Sync + 'static {
  type Data: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
  type Derived: Clone + Default + Send + Sync + 'static;

  /// Storage partition name, unique per resource.
  fn name(&self) -> &str;

  /// Endpoint substring the refresh callback is registered under.
  fn endpoint_pattern(&self) -> &str;

  fn owner_filter(&self) -> OwnerFilter {
    OwnerFilter::All
  }

  /// Endpoint whose expiry tracks this resource for `owner`.
  fn endpoint(&self, owner: &Owner) -> String;

  async fn fetch_data(&self, owner: &Owner) -> Result<FetchResponse<Self::Data>>;

  fn to_owner_data(&self, owner: Owner, data: Self::Data) -> OwnerData<Self::Data> {
    OwnerData { owner, data }
  }

  /// Empty results are cached for at least the expiry cache's floor.
  fn is_empty(&self, _data: &Self::Data) -> bool {
    false
  }

  /// Rebuild derived state from the complete set of owner data.
  fn derive(&self, _all: &[OwnerData<Self::Data>]) -> Self::Derived {
    Self::Derived::default()
  }

  async fn before_owner_update(&self, _owner: &Owner, _previous: Option<&OwnerData<Self::Data>>) {}

  async fn after_owner_update(
    &self,
    _owner: &Owner,
    _previous: Option<&OwnerData<Self::Data>>,
    _current: &OwnerData<Self::Data>,
  ) {
  }

  async fn after_batch_update(&self, _all: &[OwnerData<Self::Data>]) {}
}
