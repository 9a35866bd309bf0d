//! Cache layer that orchestrates the serving strategies with network fetching.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::revalidate::{RevalidationOutcome, RevalidationTracker};
use super::storage::{run_blocking, CacheStorage};
use super::types::{CacheResult, CachedEntry, CachedResponse, RequestKey};

/// Cache layer over a static store and a dynamic store.
///
/// Every strategy returns `Err` only when neither the stores nor the network
/// produced a response; choosing the fallback is left to the caller.
///
/// Network legs run on detached tasks owned by the layer's tracker, so a
/// response that arrives after the caller gave up is still stored.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  static_store: String,
  dynamic_store: String,
  tracker: RevalidationTracker,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(
    storage: Arc<S>,
    static_store: impl Into<String>,
    dynamic_store: impl Into<String>,
  ) -> Self {
    Self {
      storage,
      static_store: static_store.into(),
      dynamic_store: dynamic_store.into(),
      tracker: RevalidationTracker::new(),
    }
  }

  pub fn static_store(&self) -> &str {
    &self.static_store
  }

  pub fn dynamic_store(&self) -> &str {
    &self.dynamic_store
  }

  /// Tracker of the detached network legs and background refreshes.
  pub fn revalidations(&self) -> &RevalidationTracker {
    &self.tracker
  }

  /// Read `stores` in order; a failing read counts as a miss.
  async fn read_first(&self, stores: [String; 2], key: &RequestKey) -> Option<CachedEntry> {
    let key = key.clone();
    let lookup = run_blocking(&self.storage, move |storage| {
      Ok(stores.iter().find_map(|store| match storage.get(store, &key) {
        Ok(entry) => entry,
        Err(e) => {
          warn!(store = %store, key = %key, error = %e, "Cache read failed, treating as miss");
          None
        }
      }))
    });

    match lookup.await {
      Ok(entry) => entry,
      Err(e) => {
        warn!(error = %e, "Cache lookup failed, treating as miss");
        None
      }
    }
  }

  /// Look up the static store, then the dynamic store.
  pub async fn lookup(&self, key: &RequestKey) -> Option<CachedEntry> {
    let stores = [self.static_store.clone(), self.dynamic_store.clone()];
    self.read_first(stores, key).await
  }

  /// Look up the dynamic store, then the static store.
  pub async fn lookup_dynamic_first(&self, key: &RequestKey) -> Option<CachedEntry> {
    let stores = [self.dynamic_store.clone(), self.static_store.clone()];
    self.read_first(stores, key).await
  }

  /// Best-effort write into the dynamic store. Failures are logged and swallowed.
  pub async fn store_dynamic(&self, key: &RequestKey, response: &CachedResponse) -> bool {
    let store = self.dynamic_store.clone();
    let (entry_key, entry) = (key.clone(), response.clone());
    match run_blocking(&self.storage, move |s| s.put(&store, &entry_key, &entry)).await {
      Ok(()) => true,
      Err(e) => {
        warn!(store = %self.dynamic_store, key = %key, error = %e, "Cache write failed");
        false
      }
    }
  }

  /// Await `network` on a detached task that also stores the response in the
  /// dynamic store when `should_store` accepts it.
  ///
  /// Dropping the returned future leaves the task running to completion.
  async fn fetch_and_store<Fut>(
    &self,
    key: &RequestKey,
    network: Fut,
    should_store: fn(&CachedResponse) -> bool,
  ) -> Result<CachedResponse>
  where
    Fut: Future<Output = Result<CachedResponse>> + Send + 'static,
  {
    let layer = self.clone();
    let key = key.clone();

    let leg = self.tracker.spawn_detached(async move {
      let response = network.await?;
      if should_store(&response) {
        layer.store_dynamic(&key, &response).await;
      }
      Ok::<_, color_eyre::Report>(response)
    });

    leg
      .await
      .map_err(|_| eyre!("Network task ended without a result"))?
  }

  /// Cache-first.
  ///
  /// 1. Return a cached response without touching the network
  /// 2. On a miss, fetch; a 200 same-origin response is copied into the dynamic store
  /// 3. Any other network response is returned as-is, uncached
  pub async fn cache_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<CachedResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>> + Send + 'static,
  {
    if let Some(cached) = self.lookup(key).await {
      debug!(key = %key, "Cache hit");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at, false));
    }

    let response = self
      .fetch_and_store(key, fetcher(), CachedResponse::is_cacheable_basic)
      .await?;
    Ok(CacheResult::from_network(response))
  }

  /// Stale-while-revalidate.
  ///
  /// A cached response is returned immediately while a detached refresh
  /// updates the dynamic store for the next request. Without a cached
  /// response the caller waits for the network.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<CachedResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>> + Send + 'static,
  {
    let cached = self.lookup(key).await;
    let network = fetcher();

    match cached {
      Some(cached) => {
        let storage = Arc::clone(&self.storage);
        let store = self.dynamic_store.clone();
        let refresh_key = key.clone();

        self.tracker.spawn(key.clone(), async move {
          match network.await {
            Ok(response) if response.is_cacheable() => {
              let put = run_blocking(&storage, move |s| s.put(&store, &refresh_key, &response));
              match put.await {
                Ok(()) => RevalidationOutcome::Refreshed,
                Err(e) => RevalidationOutcome::WriteFailed(e.to_string()),
              }
            }
            Ok(response) => RevalidationOutcome::NotCacheable(response.status),
            Err(e) => RevalidationOutcome::FetchFailed(e.to_string()),
          }
        });

        debug!(key = %key, "Serving cached response while revalidating");
        Ok(CacheResult::from_cache(cached.response, cached.cached_at, true))
      }
      None => {
        let response = self
          .fetch_and_store(key, network, CachedResponse::is_cacheable)
          .await?;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  /// Network-first.
  ///
  /// 1. Fetch; a 200 response is copied into the dynamic store
  /// 2. On network failure, serve the dynamic store, then the static store
  pub async fn network_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<CachedResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResponse>> + Send + 'static,
  {
    match self
      .fetch_and_store(key, fetcher(), CachedResponse::is_cacheable)
      .await
    {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(e) => {
        debug!(key = %key, error = %e, "Network failed, falling back to cache");
        match self.lookup_dynamic_first(key).await {
          Some(cached) => Ok(CacheResult::from_cache(cached.response, cached.cached_at, false)),
          None => Err(e),
        }
      }
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      static_store: self.static_store.clone(),
      dynamic_store: self.dynamic_store.clone(),
      tracker: self.tracker.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage, ResponseKind};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn layer() -> CacheLayer<MemoryStorage> {
    CacheLayer::new(Arc::new(MemoryStorage::new()), "static-v1", "dynamic-v1")
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::parse("GET", &format!("https://example.org{}", path)).unwrap()
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let layer = layer();
    layer
      .storage
      .put("static-v1", &key("/index.html"), &CachedResponse::new(200, "cached"))
      .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let result = layer
      .cache_first(&key("/index.html"), move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(CachedResponse::new(200, "network"))
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"cached".to_vec());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_cache_first_only_stores_basic_200() {
    let layer = layer();

    layer
      .cache_first(&key("/a.css"), || async {
        Ok(CachedResponse::new(200, "a").with_kind(ResponseKind::Cors))
      })
      .await
      .unwrap();
    layer
      .cache_first(&key("/b.css"), || async { Ok(CachedResponse::new(404, "missing")) })
      .await
      .unwrap();
    layer
      .cache_first(&key("/c.css"), || async { Ok(CachedResponse::new(200, "c")) })
      .await
      .unwrap();

    assert_eq!(layer.storage.keys("dynamic-v1").unwrap(), vec![key("/c.css")]);
  }

  #[tokio::test]
  async fn test_network_first_prefers_dynamic_store_on_failure() {
    let layer = layer();
    layer
      .storage
      .put("static-v1", &key("/page"), &CachedResponse::new(200, "static"))
      .unwrap();
    layer
      .storage
      .put("dynamic-v1", &key("/page"), &CachedResponse::new(200, "dynamic"))
      .unwrap();

    let result = layer
      .network_first(&key("/page"), || async { Err(eyre!("offline")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"dynamic".to_vec());
  }

  #[tokio::test]
  async fn test_network_first_miss_is_error() {
    let layer = layer();
    let result = layer
      .network_first(&key("/api"), || async { Err(eyre!("offline")) })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_network_first_stores_success() {
    let layer = layer();
    let result = layer
      .network_first(&key("/page"), || async { Ok(CachedResponse::new(200, "fresh")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert!(layer.storage.get("dynamic-v1", &key("/page")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_dropped_network_first_still_stores() {
    let layer = layer();
    let gate = Arc::new(tokio::sync::Notify::new());
    let release = Arc::clone(&gate);

    let page = key("/page");
    let request = layer.network_first(&page, move || async move {
      release.notified().await;
      Ok(CachedResponse::new(200, "late"))
    });
    let abandoned = tokio::time::timeout(std::time::Duration::from_millis(20), request).await;
    assert!(abandoned.is_err());

    gate.notify_one();
    layer.revalidations().wait_idle().await;
    assert_eq!(
      layer.storage.get("dynamic-v1", &key("/page")).unwrap().unwrap().response.body,
      b"late".to_vec()
    );
  }

  #[tokio::test]
  async fn test_swr_miss_waits_for_network() {
    let layer = layer();
    let result = layer
      .stale_while_revalidate(&key("/img/a.png"), || async {
        Ok(CachedResponse::new(200, "img"))
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(layer.revalidations().stats().started, 0);
    assert!(layer.storage.get("dynamic-v1", &key("/img/a.png")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_swr_refresh_failure_keeps_cached_entry() {
    let layer = layer();
    layer
      .storage
      .put("dynamic-v1", &key("/img/a.png"), &CachedResponse::new(200, "old"))
      .unwrap();

    let result = layer
      .stale_while_revalidate(&key("/img/a.png"), || async { Err(eyre!("offline")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Stale);

    layer.revalidations().wait_idle().await;
    assert_eq!(layer.revalidations().stats().fetch_failed, 1);
    assert_eq!(
      layer.storage.get("dynamic-v1", &key("/img/a.png")).unwrap().unwrap().response.body,
      b"old".to_vec()
    );
  }
}
