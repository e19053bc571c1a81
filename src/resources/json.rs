use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::config::ResourceConfig;
use crate::esi::{FetchOptions, FetchResponse, RemoteFetch};
use crate::owner::{Owner, OwnerFilter};
use crate::store::OwnerDataSource;

/// Untyped resource described entirely by configuration.
///
/// Data is kept as raw JSON; paginated resources are stored as one array.
pub struct JsonResource {
  config: ResourceConfig,
  fetcher: Arc<dyn RemoteFetch>,
}

impl JsonResource {
  pub fn new(config: ResourceConfig, fetcher: Arc<dyn RemoteFetch>) -> Self {
    Self { config, fetcher }
  }
}

#[async_trait]
impl OwnerDataSource for JsonResource {
  type Data = Value;
  type Derived = ();

  fn name(&self) -> &str {
    &self.config.name
  }

  fn endpoint_pattern(&self) -> &str {
    &self.config.pattern
  }

  fn owner_filter(&self) -> OwnerFilter {
    self.config.owners
  }

  fn endpoint(&self, owner: &Owner) -> String {
    self.config.path.replace("{id}", &owner.id.to_string())
  }

  async fn fetch_data(&self, owner: &Owner) -> Result<FetchResponse<Value>> {
    let endpoint = self.endpoint(owner);
    let opts = FetchOptions::for_character(owner.character_id);
    if self.config.paginated {
      Ok(
        self
          .fetcher
          .fetch_paginated(&endpoint, &opts)
          .await?
          .map(Value::Array),
      )
    } else {
      self.fetcher.fetch(&endpoint, &opts).await
    }
  }

  fn is_empty(&self, data: &Value) -> bool {
    match data {
      Value::Null => true,
      Value::Array(items) => items.is_empty(),
      Value::Object(fields) => fields.is_empty(),
      _ => false,
    }
  }
}
