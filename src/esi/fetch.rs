//! Contract for the remote fetch client consumed by the sync layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
  /// Character whose token authenticates the request.
  pub character_id: u64,
  /// Validator from a previous response, sent as `If-None-Match`.
  pub etag: Option<String>,
}

impl FetchOptions {
  pub fn for_character(character_id: u64) -> Self {
    Self {
      character_id,
      etag: None,
    }
  }
}

/// Payload plus cache-control metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse<T> {
  pub data: T,
  pub expires_at: DateTime<Utc>,
  pub etag: Option<String>,
}

impl<T> FetchResponse<T> {
  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchResponse<U> {
    FetchResponse {
      data: f(self.data),
      expires_at: self.expires_at,
      etag: self.etag,
    }
  }

  pub fn try_map<U>(self, f: impl FnOnce(T) -> Result<U>) -> Result<FetchResponse<U>> {
    Ok(FetchResponse {
      data: f(self.data)?,
      expires_at: self.expires_at,
      etag: self.etag,
    })
  }
}

/// Authenticated fetch of a remote resource.
///
/// Implementations fail on transport, HTTP and decoding errors; the store
/// layer decides what to do about it.
#[async_trait]
pub trait RemoteFetch: Send + Sync {
  async fn fetch(&self, endpoint: &str, opts: &FetchOptions) -> Result<FetchResponse<Value>>;

  /// Fetch every page of a paginated resource, concatenated in page order.
  async fn fetch_paginated(
    &self,
    endpoint: &str,
    opts: &FetchOptions,
  ) -> Result<FetchResponse<Vec<Value>>>;
}

/// Typed decoding over [`RemoteFetch`]; a decode failure is a fetch failure.
#[async_trait]
pub trait RemoteFetchExt: RemoteFetch {
  async fn fetch_as<T: DeserializeOwned + Send>(
    &self,
    endpoint: &str,
    opts: &FetchOptions,
  ) -> Result<FetchResponse<T>> {
    self.fetch(endpoint, opts).await?.try_map(|value| {
      serde_json::from_value(value).map_err(|e| eyre!("Unexpected response from {}: {}", endpoint, e))
    })
  }

  async fn fetch_paginated_as<T: DeserializeOwned + Send>(
    &self,
    endpoint: &str,
    opts: &FetchOptions,
  ) -> Result<FetchResponse<Vec<T>>> {
    self.fetch_paginated(endpoint, opts).await?.try_map(|items| {
      items
        .into_iter()
        .map(|item| {
          serde_json::from_value(item)
            .map_err(|e| eyre!("Unexpected item from {}: {}", endpoint, e))
        })
        .collect()
    })
  }
}

impl<F: RemoteFetch + ?Sized> RemoteFetchExt for F {}
