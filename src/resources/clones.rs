use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;

use crate::esi::api_types::ApiClones;
use crate::esi::{FetchOptions, FetchResponse, RemoteFetch, RemoteFetchExt};
use crate::owner::{Owner, OwnerFilter};
use crate::store::OwnerDataSource;

/// Jump clones and home location per character.
pub struct Clones {
  fetcher: Arc<dyn RemoteFetch>,
}

impl Clones {
  pub fn new(fetcher: Arc<dyn RemoteFetch>) -> Self {
    Self { fetcher }
  }
}

#[async_trait]
impl OwnerDataSource for Clones {
  type Data = ApiClones;
  type Derived = ();

  fn name(&self) -> &str {
    "clones"
  }

  fn endpoint_pattern(&self) -> &str {
    "/clones"
  }

  fn owner_filter(&self) -> OwnerFilter {
    OwnerFilter::Character
  }

  fn endpoint(&self, owner: &Owner) -> String {
    format!("/characters/{}/clones/", owner.id)
  }

  async fn fetch_data(&self, owner: &Owner) -> Result<FetchResponse<ApiClones>> {
    self
      .fetcher
      .fetch_as(&self.endpoint(owner), &FetchOptions::for_character(owner.character_id))
      .await
  }

  fn is_empty(&self, data: &ApiClones) -> bool {
    data.home_location.is_none() && data.jump_clones.is_empty()
  }
}
