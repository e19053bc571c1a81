use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, ETAG, EXPIRES, IF_NONE_MATCH, USER_AGENT};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::fetch::{FetchOptions, FetchResponse, RemoteFetch};
use crate::config::EsiConfig;

/// Fallback cache window when a response carries no `Expires` header.
const DEFAULT_CACHE_WINDOW_SECS: i64 = 300;

/// Source of bearer tokens per character.
pub trait TokenSource: Send + Sync {
  fn access_token(&self, character_id: u64) -> Result<String>;
}

/// Tokens from the environment.
///
/// Checks `ESI_TOKEN_<character_id>` first, then `ESI_ACCESS_TOKEN`.
pub struct EnvTokenSource;

impl TokenSource for EnvTokenSource {
  fn access_token(&self, character_id: u64) -> Result<String> {
    std::env::var(format!("ESI_TOKEN_{}", character_id))
      .or_else(|_| std::env::var("ESI_ACCESS_TOKEN"))
      .map_err(|_| {
        eyre!(
          "No access token for character {}. Set ESI_TOKEN_{} or ESI_ACCESS_TOKEN.",
          character_id,
          character_id
        )
      })
  }
}

/// ESI HTTP client
#[derive(Clone)]
pub struct EsiClient {
  http: reqwest::Client,
  base_url: Url,
  user_agent: String,
  compatibility_date: Option<String>,
  tokens: Arc<dyn TokenSource>,
}

impl EsiClient {
  pub fn new(config: &EsiConfig, tokens: Arc<dyn TokenSource>) -> Result<Self> {
    // Url::join drops the last segment unless the base ends with '/'
    let mut base = config.base_url.clone();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid ESI base URL {}: {}", config.base_url, e))?;

    let http = reqwest::Client::builder()
      .gzip(true)
      .deflate(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      user_agent: config.user_agent.clone(),
      compatibility_date: config.compatibility_date.clone(),
      tokens,
    })
  }

  fn url(&self, endpoint: &str, page: Option<u32>) -> Result<Url> {
    let mut url = self
      .base_url
      .join(endpoint.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid endpoint {}: {}", endpoint, e))?;
    if let Some(page) = page {
      url.query_pairs_mut().append_pair("page", &page.to_string());
    }
    Ok(url)
  }

  async fn get(
    &self,
    endpoint: &str,
    opts: &FetchOptions,
    page: Option<u32>,
  ) -> Result<(Value, HeaderMap)> {
    let url = self.url(endpoint, page)?;
    let token = self.tokens.access_token(opts.character_id)?;

    let mut request = self
      .http
      .get(url.clone())
      .bearer_auth(token)
      .header(USER_AGENT, &self.user_agent);
    if let Some(date) = &self.compatibility_date {
      request = request.header("X-Compatibility-Date", date);
    }
    if let Some(etag) = &opts.etag {
      request = request.header(IF_NONE_MATCH, etag);
    }

    debug!(url = %url, "GET");
    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", endpoint, e))?;

    let status = response.status();
    if status == StatusCode::NOT_MODIFIED {
      return Err(eyre!("{} not modified since ETag {:?}", endpoint, opts.etag));
    }
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(eyre!("{} returned {}: {}", endpoint, status, body));
    }

    let headers = response.headers().clone();
    let body: Value = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", endpoint, e))?;

    Ok((body, headers))
  }
}

/// Parse the `Expires` header, falling back to a short default window.
fn expires_at(headers: &HeaderMap) -> DateTime<Utc> {
  headers
    .get(EXPIRES)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    .map(|dt| dt.with_timezone(&Utc))
    .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_CACHE_WINDOW_SECS))
}

fn etag(headers: &HeaderMap) -> Option<String> {
  headers
    .get(ETAG)
    .and_then(|v| v.to_str().ok())
    .map(String::from)
}

fn page_count(headers: &HeaderMap) -> u32 {
  headers
    .get("x-pages")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
    .unwrap_or(1)
}

#[async_trait]
impl RemoteFetch for EsiClient {
  async fn fetch(&self, endpoint: &str, opts: &FetchOptions) -> Result<FetchResponse<Value>> {
    let (data, headers) = self.get(endpoint, opts, None).await?;
    Ok(FetchResponse {
      data,
      expires_at: expires_at(&headers),
      etag: etag(&headers),
    })
  }

  async fn fetch_paginated(
    &self,
    endpoint: &str,
    opts: &FetchOptions,
  ) -> Result<FetchResponse<Vec<Value>>> {
    let (first, headers) = self.get(endpoint, opts, Some(1)).await?;
    let pages = page_count(&headers);
    let mut expires = expires_at(&headers);
    let first_etag = etag(&headers);

    let mut items = into_items(endpoint, first)?;

    // Later pages carry no reusable validator
    let page_opts = FetchOptions {
      character_id: opts.character_id,
      etag: None,
    };
    for page in 2..=pages {
      let (body, headers) = self.get(endpoint, &page_opts, Some(page)).await?;
      expires = expires.min(expires_at(&headers));
      items.extend(into_items(endpoint, body)?);
    }

    Ok(FetchResponse {
      data: items,
      expires_at: expires,
      etag: first_etag,
    })
  }
}

fn into_items(endpoint: &str, body: Value) -> Result<Vec<Value>> {
  match body {
    Value::Array(items) => Ok(items),
    other => Err(eyre!(
      "Expected a JSON array from {}, got {}",
      endpoint,
      type_name(&other)
    )),
  }
}

fn type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}
