//! Per-owner EVE Online data sync.
//!
//! [`cache::ExpiryCache`] tracks when each `(owner, endpoint)` goes stale
//! and drives refreshes; [`store::OwnerStore`] fetches, persists and
//! publishes one resource for every owner.

pub mod cache;
pub mod config;
pub mod esi;
pub mod logging;
pub mod owner;
pub mod paths;
pub mod resources;
pub mod store;
