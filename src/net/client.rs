use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Fetcher, Request};
use crate::cache::{CachedResponse, ResponseKind};

/// Default bound on a single network attempt.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(8);

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: Client,
  origin: Url,
}

impl HttpFetcher {
  /// Create a fetcher for pages served from `origin`, with a bounded per-request timeout.
  pub fn new(origin: Url, timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .connect_timeout(timeout.min(Duration::from_secs(5)))
      .user_agent(concat!("swcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  async fn execute(&self, request: &Request) -> Result<CachedResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    debug!(method = %request.method, url = %request.url, "Fetching from network");

    let response = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    let kind = if request.url.origin() == self.origin.origin() {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    };

    Ok(CachedResponse {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
      kind,
    })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<CachedResponse>> {
    self.execute(request).boxed()
  }
}
