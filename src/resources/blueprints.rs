use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::esi::api_types::ApiBlueprint;
use crate::esi::{FetchOptions, FetchResponse, RemoteFetch, RemoteFetchExt};
use crate::owner::{Owner, OwnerType};
use crate::store::{OwnerData, OwnerDataSource};

/// A blueprint together with the owner holding it.
#[derive(Debug, Clone, PartialEq)]
pub struct BlueprintInfo {
  pub owner_key: String,
  pub owner_name: String,
  pub blueprint: ApiBlueprint,
}

/// Blueprints of every owner, keyed by item id.
#[derive(Debug, Clone, Default)]
pub struct BlueprintIndex {
  pub by_item_id: HashMap<u64, BlueprintInfo>,
}

impl BlueprintIndex {
  pub fn get(&self, item_id: u64) -> Option<&BlueprintInfo> {
    self.by_item_id.get(&item_id)
  }

  pub fn len(&self) -> usize {
    self.by_item_id.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_item_id.is_empty()
  }
}

/// Character and corporation blueprints.
pub struct Blueprints {
  fetcher: Arc<dyn RemoteFetch>,
}

impl Blueprints {
  pub fn new(fetcher: Arc<dyn RemoteFetch>) -> Self {
    Self { fetcher }
  }
}

#[async_trait]
impl OwnerDataSource for Blueprints {
  type Data = Vec<ApiBlueprint>;
  type Derived = BlueprintIndex;

  fn name(&self) -> &str {
    "blueprints"
  }

  fn endpoint_pattern(&self) -> &str {
    "/blueprints"
  }

  fn endpoint(&self, owner: &Owner) -> String {
    match owner.owner_type {
      OwnerType::Character => format!("/characters/{}/blueprints/", owner.id),
      OwnerType::Corporation => format!("/corporations/{}/blueprints/", owner.id),
    }
  }

  async fn fetch_data(&self, owner: &Owner) -> Result<FetchResponse<Vec<ApiBlueprint>>> {
    self
      .fetcher
      .fetch_paginated_as(&self.endpoint(owner), &FetchOptions::for_character(owner.character_id))
      .await
  }

  fn is_empty(&self, data: &Vec<ApiBlueprint>) -> bool {
    data.is_empty()
  }

  fn derive(&self, all: &[OwnerData<Vec<ApiBlueprint>>]) -> BlueprintIndex {
    let by_item_id = all
      .iter()
      .flat_map(|owner_data| {
        owner_data.data.iter().map(move |bp| {
          (
            bp.item_id,
            BlueprintInfo {
              owner_key: owner_data.key(),
              owner_name: owner_data.owner.name.clone(),
              blueprint: bp.clone(),
            },
          )
        })
      })
      .collect();
    BlueprintIndex { by_item_id }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ExpiryCache, ExpiryConfig, KvStore, MemoryStorage};
  use crate::owner::OwnerSet;
  use crate::resources::testing::CannedFetch;
  use crate::store::OwnerStore;
  use serde_json::json;

  fn blueprint(item_id: u64, type_id: u32) -> serde_json::Value {
    json!({
      "item_id": item_id,
      "type_id": type_id,
      "location_id": 60003760,
      "location_flag": "Hangar",
      "material_efficiency": 10,
      "time_efficiency": 20,
      "quantity": -1,
      "runs": -1
    })
  }

  #[test]
  fn test_endpoint_by_owner_type() {
    let source = Blueprints::new(Arc::new(CannedFetch::default()));
    assert_eq!(
      source.endpoint(&Owner::character(1, "A")),
      "/characters/1/blueprints/"
    );
    assert_eq!(
      source.endpoint(&Owner::corporation(2, "C", 1)),
      "/corporations/2/blueprints/"
    );
  }

  #[tokio::test]
  async fn test_index_rebuilt_across_owners() {
    let fetch = Arc::new(CannedFetch::default());
    fetch.set(
      "/characters/1/blueprints/",
      json!([blueprint(11, 100), blueprint(12, 101)]),
    );
    fetch.set("/corporations/2/blueprints/", json!([blueprint(21, 200)]));

    let storage: Arc<dyn KvStore> = Arc::new(MemoryStorage::new());
    let owners = Arc::new(OwnerSet::new(vec![
      Owner::character(1, "Pilot"),
      Owner::corporation(2, "Corp", 1),
    ]));
    let cache = ExpiryCache::new(Arc::clone(&storage), owners.clone(), ExpiryConfig::default());
    let store = OwnerStore::new(Blueprints::new(fetch.clone()), cache, storage, owners);

    store.update(true).await;
    let index = store.snapshot().derived.clone();
    assert_eq!(index.len(), 3);
    assert_eq!(index.get(21).unwrap().owner_key, "corporation-2");
    assert_eq!(index.get(11).unwrap().owner_name, "Pilot");

    // Corporation requests authenticate as the configured character
    assert!(fetch
      .requests
      .lock()
      .unwrap()
      .contains(&("/corporations/2/blueprints/".to_string(), 1)));

    // Full rebuild drops blueprints that disappeared
    fetch.set("/characters/1/blueprints/", json!([blueprint(12, 101)]));
    store
      .update_for_owner(&Owner::character(1, "Pilot"))
      .await
      .unwrap();
    let index = store.snapshot().derived.clone();
    assert_eq!(index.len(), 2);
    assert!(index.get(11).is_none());
  }
}
