//! Generic per-owner data stores layered on the expiry cache.
//!
//! A store fetches one resource for every applicable owner, persists the
//! result, publishes snapshots to subscribers and reports new expiries
//! back to the cache. The cache decides when to refresh; the store knows
//! how.

mod owner_store;
mod source;

pub use owner_store::{OwnerStore, StoreState, StoreSummary, SyncedStore};
pub use source::{OwnerData, OwnerDataSource};
