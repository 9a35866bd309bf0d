//! Core types for the cache stores: request identity, captured responses and
//! the provenance of a served response.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Body of the synthetic response returned when a resource is unavailable offline.
pub const OFFLINE_BODY: &str = "Resource unavailable offline";

/// Normalized identity of a request inside a cache store.
///
/// Two requests that differ only by URL fragment map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  /// Key for a GET request to `url`.
  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  /// Parse an absolute URL string into a key.
  pub fn parse(method: &str, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::new(method, &url))
  }

  /// Stable, fixed-length storage key (SHA-256 of method and URL).
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// How a response was obtained, mirroring the fetch `Response.type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Cross-origin response with readable body
  Cors,
  /// Cross-origin response without readable body
  Opaque,
  /// Network error
  Error,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Error => "error",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "basic" => Ok(Self::Basic),
      "cors" => Ok(Self::Cors),
      "opaque" => Ok(Self::Opaque),
      "error" => Ok(Self::Error),
      other => Err(eyre!("Unknown response kind '{}'", other)),
    }
  }
}

/// A captured response: status, headers and a snapshot of the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub kind: ResponseKind,
}

impl CachedResponse {
  /// A same-origin response with the given status and body.
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: String::new(),
      headers: Vec::new(),
      body: body.into(),
      kind: ResponseKind::Basic,
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_kind(mut self, kind: ResponseKind) -> Self {
    self.kind = kind;
    self
  }

  pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
    self.status_text = text.into();
    self
  }

  /// Synthetic 408 returned for non-document requests that cannot be served.
  pub fn offline_unavailable() -> Self {
    Self::new(408, OFFLINE_BODY)
      .with_status_text("Request Timeout")
      .with_header("Content-Type", "text/plain")
  }

  /// The network-error response (status 0), equivalent to `Response.error()`.
  pub fn network_error() -> Self {
    Self::new(0, Vec::new()).with_kind(ResponseKind::Error)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Eligible for opportunistic caching (exactly 200).
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  /// Eligible for caching under the static strategy (200 and same-origin).
  pub fn is_cacheable_basic(&self) -> bool {
    self.is_cacheable() && self.kind == ResponseKind::Basic
  }

  pub fn is_network_error(&self) -> bool {
    self.kind == ResponseKind::Error
  }
}

/// A response as read back from a store.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: CachedResponse,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Result of handling an intercepted request, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Served from a store; `revalidating` marks a stale-while-revalidate hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, revalidating: bool) -> Self {
    Self {
      data,
      source: if revalidating {
        CacheSource::Stale
      } else {
        CacheSource::Cache
      },
      cached_at: Some(cached_at),
    }
  }

  pub fn offline_page(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::OfflinePage,
      cached_at: Some(cached_at),
    }
  }

  pub fn synthetic(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthetic,
      cached_at: None,
    }
  }

  pub fn network_error(data: T) -> Self {
    Self {
      data,
      source: CacheSource::NetworkError,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from the network
  Network,
  /// Response from a cache store, network not consulted
  Cache,
  /// Response from a cache store while a background refresh runs
  Stale,
  /// The offline fallback page
  OfflinePage,
  /// The synthetic 408 response
  Synthetic,
  /// Nothing could be produced; network-error response
  NetworkError,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Stale => "cache (revalidating)",
      Self::OfflinePage => "offline page",
      Self::Synthetic => "synthetic",
      Self::NetworkError => "network error",
    };
    f.write_str(s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_strips_fragment_and_uppercases_method() {
    let a = RequestKey::parse("get", "https://example.org/index.html#top").unwrap();
    let b = RequestKey::parse("GET", "https://example.org/index.html").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
  }

  #[test]
  fn test_key_distinguishes_query() {
    let a = RequestKey::parse("GET", "https://example.org/a?x=1").unwrap();
    let b = RequestKey::parse("GET", "https://example.org/a?x=2").unwrap();
    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_offline_unavailable_response() {
    let resp = CachedResponse::offline_unavailable();
    assert_eq!(resp.status, 408);
    assert_eq!(resp.header("content-type"), Some("text/plain"));
    assert_eq!(resp.body, OFFLINE_BODY.as_bytes());
  }

  #[test]
  fn test_cacheability() {
    assert!(CachedResponse::new(200, "x").is_cacheable_basic());
    let cors = CachedResponse::new(200, "x").with_kind(ResponseKind::Cors);
    assert!(cors.is_cacheable());
    assert!(!cors.is_cacheable_basic());
    assert!(CachedResponse::new(204, "").is_ok());
    assert!(!CachedResponse::new(204, "").is_cacheable());
    assert!(CachedResponse::network_error().is_network_error());
  }
}
