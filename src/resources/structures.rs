use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::esi::api_types::ApiStructure;
use crate::esi::{FetchOptions, FetchResponse, RemoteFetch, RemoteFetchExt};
use crate::owner::{Owner, OwnerFilter};
use crate::store::{OwnerData, OwnerDataSource};

/// Remaining fuel below which a structure is reported.
pub const LOW_FUEL_HOURS: i64 = 24;

/// A change worth telling someone about between two structure snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum StructureNotice {
  StateChanged {
    structure_id: u64,
    name: String,
    from: String,
    to: String,
  },
  LowFuel {
    structure_id: u64,
    name: String,
    fuel_expires: DateTime<Utc>,
  },
  Removed {
    structure_id: u64,
    name: String,
  },
}

/// Compare two snapshots of one corporation's structures.
///
/// New structures are silent; fuel is only reported when it crosses the
/// threshold, not on every refresh while it stays low.
pub fn diff_structures(
  previous: &[ApiStructure],
  current: &[ApiStructure],
  now: DateTime<Utc>,
) -> Vec<StructureNotice> {
  let low_fuel = |s: &ApiStructure| {
    s.fuel_expires
      .map(|at| at - now < Duration::hours(LOW_FUEL_HOURS))
      .unwrap_or(false)
  };

  let before: HashMap<u64, &ApiStructure> =
    previous.iter().map(|s| (s.structure_id, s)).collect();
  let mut notices = Vec::new();

  for structure in current {
    let Some(&old) = before.get(&structure.structure_id) else {
      continue;
    };
    if old.state != structure.state {
      notices.push(StructureNotice::StateChanged {
        structure_id: structure.structure_id,
        name: structure.display_name(),
        from: old.state.clone(),
        to: structure.state.clone(),
      });
    }
    if low_fuel(structure) && !low_fuel(old) {
      if let Some(fuel_expires) = structure.fuel_expires {
        notices.push(StructureNotice::LowFuel {
          structure_id: structure.structure_id,
          name: structure.display_name(),
          fuel_expires,
        });
      }
    }
  }

  for old in previous {
    if !current.iter().any(|s| s.structure_id == old.structure_id) {
      notices.push(StructureNotice::Removed {
        structure_id: old.structure_id,
        name: old.display_name(),
      });
    }
  }

  notices
}

/// Corporation-owned Upwell structures.
pub struct Structures {
  fetcher: Arc<dyn RemoteFetch>,
  notices: Mutex<Vec<(String, StructureNotice)>>,
}

impl Structures {
  pub fn new(fetcher: Arc<dyn RemoteFetch>) -> Self {
    Self {
      fetcher,
      notices: Mutex::new(Vec::new()),
    }
  }

  /// Drain notices collected since the last call, tagged with owner key.
  pub fn take_notices(&self) -> Vec<(String, StructureNotice)> {
    match self.notices.lock() {
      Ok(mut notices) => std::mem::take(&mut *notices),
      Err(_) => Vec::new(),
    }
  }
}

#[async_trait]
impl OwnerDataSource for Structures {
  type Data = Vec<ApiStructure>;
  type Derived = ();

  fn name(&self) -> &str {
    "structures"
  }

  fn endpoint_pattern(&self) -> &str {
    "/structures"
  }

  fn owner_filter(&self) -> OwnerFilter {
    OwnerFilter::Corporation
  }

  fn endpoint(&self, owner: &Owner) -> String {
    format!("/corporations/{}/structures/", owner.id)
  }

  async fn fetch_data(&self, owner: &Owner) -> Result<FetchResponse<Vec<ApiStructure>>> {
    self
      .fetcher
      .fetch_paginated_as(&self.endpoint(owner), &FetchOptions::for_character(owner.character_id))
      .await
  }

  fn is_empty(&self, data: &Vec<ApiStructure>) -> bool {
    data.is_empty()
  }

  async fn after_owner_update(
    &self,
    owner: &Owner,
    previous: Option<&OwnerData<Vec<ApiStructure>>>,
    current: &OwnerData<Vec<ApiStructure>>,
  ) {
    let Some(previous) = previous else {
      return;
    };
    let found = diff_structures(&previous.data, &current.data, Utc::now());
    for notice in &found {
      match notice {
        StructureNotice::StateChanged { name, from, to, .. } => {
          info!("{}: {} changed state {} -> {}", owner.name, name, from, to)
        }
        StructureNotice::LowFuel {
          name, fuel_expires, ..
        } => warn!("{}: {} runs out of fuel at {}", owner.name, name, fuel_expires),
        StructureNotice::Removed { name, .. } => {
          info!("{}: {} is no longer listed", owner.name, name)
        }
      }
    }
    if let Ok(mut notices) = self.notices.lock() {
      notices.extend(found.into_iter().map(|n| (owner.key(), n)));
    }
  }
}
