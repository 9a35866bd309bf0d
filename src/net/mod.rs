//! Request descriptors and the network boundary.

mod client;

pub use client::HttpFetcher;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use url::Url;

use crate::cache::{CachedResponse, RequestKey};

/// What kind of resource a request is for, as reported by the requesting page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
  #[default]
  Other,
}

impl Destination {
  /// Parse a destination name; unknown names map to `Other`.
  pub fn parse(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "document" => Self::Document,
      "image" => Self::Image,
      "script" => Self::Script,
      "style" => Self::Style,
      "font" => Self::Font,
      "manifest" => Self::Manifest,
      _ => Self::Other,
    }
  }
}

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: &str, url: Url, destination: Destination) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      destination,
    }
  }

  pub fn get(url: Url, destination: Destination) -> Self {
    Self::new("GET", url, destination)
  }

  /// Parse an absolute URL into a GET request.
  pub fn parse(url: &str, destination: Destination) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::get(url, destination))
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Cache identity of this request.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Source of network responses.
///
/// A transport failure (offline, DNS, timeout) is an `Err`. An HTTP error
/// status is still an `Ok` response carrying that status.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<CachedResponse>>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_destination_parse() {
    assert_eq!(Destination::parse("Document"), Destination::Document);
    assert_eq!(Destination::parse(" image "), Destination::Image);
    assert_eq!(Destination::parse("audio"), Destination::Other);
    assert_eq!(Destination::parse(""), Destination::Other);
  }

  #[test]
  fn test_request_key_matches_cache_key() {
    let req = Request::parse("https://example.org/css/estilo.css#x", Destination::Style).unwrap();
    assert!(req.is_get());
    assert_eq!(
      req.key(),
      RequestKey::parse("GET", "https://example.org/css/estilo.css").unwrap()
    );
  }
}
