//! Offline resource cache manager.
//!
//! Intercepts outgoing GET requests, picks a serving strategy per request and
//! maintains two named stores:
//! - a static store, versioned by tag, populated once during setup
//! - a dynamic store, filled opportunistically while handling requests
//!
//! The host drives the manager through four calls: `setup` once on install,
//! `activate` once per upgrade, `handle_request` per intercepted request and
//! `handle_sync` for deferred-work events.

mod lifecycle;
mod route;

pub use lifecycle::{LifecycleHooks, NoopHooks, WorkerState};
pub use route::{Route, Router};

use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{
  run_blocking, CacheLayer, CacheResult, CacheSource, CacheStorage, CachedResponse, RequestKey,
  RevalidationTracker,
};
use crate::net::{Destination, Fetcher, Request};

/// Sync tag for deferred feedback submission.
pub const BACKGROUND_FEEDBACK_SYNC: &str = "background-feedback-sync";

/// Resolved configuration of one manager instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Origin of the pages being served
  pub origin: Url,
  pub static_store: String,
  pub dynamic_store: String,
  /// Absolute URLs required for offline operation
  pub static_assets: Vec<Url>,
  /// Document served for failed navigations
  pub offline_page: Url,
  /// Cross-origin hosts handled like static assets
  pub allowed_hosts: Vec<String>,
  /// Upper bound on a single network attempt
  pub fetch_timeout: Duration,
}

impl WorkerConfig {
  /// Store name for a prefix and version tag, e.g. `biblia-mobile-v4`.
  pub fn store_name(prefix: &str, version: u32) -> String {
    format!("{}-v{}", prefix, version)
  }
}

/// Result of a successful setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupReport {
  pub store: String,
  pub cached: usize,
}

/// Result of activation cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  /// Stale stores that could not be deleted, with the reason
  pub failed: Vec<(String, String)>,
}

/// Decision for one intercepted request.
#[derive(Debug, Clone)]
pub enum Intercept {
  /// Not handled; the host performs its default network request
  Passthrough,
  /// Handled; always carries a response
  Respond(CacheResult<CachedResponse>),
}

impl Intercept {
  pub fn response(&self) -> Option<&CachedResponse> {
    match self {
      Self::Passthrough => None,
      Self::Respond(result) => Some(&result.data),
    }
  }

  pub fn source(&self) -> Option<CacheSource> {
    match self {
      Self::Passthrough => None,
      Self::Respond(result) => Some(result.source),
    }
  }
}

/// Outcome of a sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  Recognized,
  Ignored,
}

/// Bound a fetch by `timeout`; elapsing counts as a network failure.
async fn fetch_bounded<F: Fetcher + ?Sized>(
  fetcher: &F,
  request: &Request,
  timeout: Duration,
) -> Result<CachedResponse> {
  match tokio::time::timeout(timeout, fetcher.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(eyre!(
      "Timed out after {}ms fetching {}",
      timeout.as_millis(),
      request.url
    )),
  }
}

/// The offline resource cache manager.
pub struct OfflineCacheManager<S: CacheStorage + 'static, F: Fetcher + 'static> {
  config: WorkerConfig,
  router: Router,
  layer: CacheLayer<S>,
  storage: Arc<S>,
  fetcher: Arc<F>,
  hooks: Arc<dyn LifecycleHooks>,
  state: Mutex<WorkerState>,
}

impl<S: CacheStorage + 'static, F: Fetcher + 'static> OfflineCacheManager<S, F> {
  pub fn new(config: WorkerConfig, storage: Arc<S>, fetcher: Arc<F>) -> Self {
    let router = Router::new(
      config.origin.clone(),
      &config.static_assets,
      &config.allowed_hosts,
    );
    let layer = CacheLayer::new(
      Arc::clone(&storage),
      config.static_store.clone(),
      config.dynamic_store.clone(),
    );

    Self {
      config,
      router,
      layer,
      storage,
      fetcher,
      hooks: Arc::new(NoopHooks),
      state: Mutex::new(WorkerState::Parsed),
    }
  }

  /// Set the host primitives called at the end of setup and activation.
  pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
    self.hooks = hooks;
    self
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Tracker of background refreshes and of network legs still in flight.
  pub fn revalidations(&self) -> &RevalidationTracker {
    self.layer.revalidations()
  }

  async fn fetch(&self, request: &Request) -> Result<CachedResponse> {
    fetch_bounded(self.fetcher.as_ref(), request, self.config.fetch_timeout).await
  }

  /// Owned bounded fetch that can outlive the request being handled.
  fn network(&self, request: &Request) -> BoxFuture<'static, Result<CachedResponse>> {
    let fetcher = Arc::clone(&self.fetcher);
    let request = request.clone();
    let timeout = self.config.fetch_timeout;
    async move { fetch_bounded(fetcher.as_ref(), &request, timeout).await }.boxed()
  }

  /// Populate the static store with every listed asset.
  ///
  /// Fails as a whole if any asset cannot be fetched with a 2xx status;
  /// nothing is written in that case. On success the host is asked to
  /// activate this instance immediately.
  pub async fn setup(&self) -> Result<SetupReport> {
    self.set_state(WorkerState::Installing);

    match self.populate_static().await {
      Ok(cached) => {
        self.set_state(WorkerState::Installed);
        info!(store = %self.config.static_store, cached, "Static cache installed");
        self.hooks.skip_waiting();
        Ok(SetupReport {
          store: self.config.static_store.clone(),
          cached,
        })
      }
      Err(e) => {
        self.set_state(WorkerState::Redundant);
        error!(store = %self.config.static_store, error = %e, "Static cache installation failed");
        Err(e.wrap_err(format!(
          "Failed to install static cache {}",
          self.config.static_store
        )))
      }
    }
  }

  async fn populate_static(&self) -> Result<usize> {
    let stores = [
      self.config.static_store.clone(),
      self.config.dynamic_store.clone(),
    ];
    run_blocking(&self.storage, move |storage| {
      stores.iter().try_for_each(|name| storage.open_store(name))
    })
    .await?;

    let fetches = self.config.static_assets.iter().map(|url| async move {
      let request = Request::get(url.clone(), Destination::Other);
      let response = self
        .fetch(&request)
        .await
        .wrap_err_with(|| format!("Failed to fetch static asset {}", url))?;
      if !response.is_ok() {
        return Err(eyre!(
          "Static asset {} returned status {}",
          url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request.key(), response))
    });

    let entries = try_join_all(fetches).await?;
    let cached = entries.len();
    let store = self.config.static_store.clone();
    run_blocking(&self.storage, move |storage| storage.put_all(&store, &entries))
      .await
      .wrap_err("Failed to write static assets")?;

    Ok(cached)
  }

  /// Delete every store other than the current static and dynamic stores,
  /// then claim open clients.
  ///
  /// Deletions run concurrently; a failing one is reported and does not
  /// stop the others or the activation itself.
  pub async fn activate(&self) -> ActivationReport {
    self.set_state(WorkerState::Activating);
    let mut report = ActivationReport::default();

    let names = match run_blocking(&self.storage, |storage| storage.store_names()).await {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "Failed to enumerate cache stores");
        Vec::new()
      }
    };

    let stale: Vec<String> = names
      .into_iter()
      .filter(|n| *n != self.config.static_store && *n != self.config.dynamic_store)
      .collect();

    let deletions = stale.into_iter().map(|name| async move {
      info!(store = %name, "Removing stale cache store");
      let task_name = name.clone();
      let result =
        run_blocking(&self.storage, move |storage| storage.delete_store(&task_name)).await;
      (name, result)
    });

    for (name, result) in join_all(deletions).await {
      match result {
        Ok(_) => report.deleted.push(name),
        Err(e) => {
          warn!(store = %name, error = %e, "Failed to delete stale cache store");
          report.failed.push((name, e.to_string()));
        }
      }
    }

    self.hooks.claim_clients();
    self.set_state(WorkerState::Activated);
    info!(
      deleted = report.deleted.len(),
      failed = report.failed.len(),
      "Cache manager activated"
    );

    report
  }

  /// Handle one intercepted request.
  pub async fn handle_request(&self, request: &Request) -> Intercept {
    let route = self.router.classify(request);

    let result = match route {
      Route::Passthrough => {
        debug!(method = %request.method, url = %request.url, "Not intercepted");
        return Intercept::Passthrough;
      }
      Route::Static => self.serve_static(request).await,
      Route::Image => self.serve_image(request).await,
      Route::Default => self.serve_default(request).await,
    };

    debug!(
      url = %request.url,
      route = ?route,
      source = %result.source,
      status = result.data.status,
      "Request handled"
    );
    Intercept::Respond(result)
  }

  async fn serve_static(&self, request: &Request) -> CacheResult<CachedResponse> {
    match self
      .layer
      .cache_first(&request.key(), || self.network(request))
      .await
    {
      Ok(result) => result,
      Err(e) => {
        debug!(url = %request.url, error = %e, "Static resource unavailable");
        self.fallback(request).await
      }
    }
  }

  async fn serve_image(&self, request: &Request) -> CacheResult<CachedResponse> {
    let result = self
      .layer
      .stale_while_revalidate(&request.key(), || self.network(request))
      .await;

    match result {
      Ok(result) => result,
      Err(e) => {
        debug!(url = %request.url, error = %e, "Image unavailable");
        CacheResult::network_error(CachedResponse::network_error())
      }
    }
  }

  async fn serve_default(&self, request: &Request) -> CacheResult<CachedResponse> {
    match self
      .layer
      .network_first(&request.key(), || self.network(request))
      .await
    {
      Ok(result) => result,
      Err(e) => {
        debug!(url = %request.url, error = %e, "Resource unavailable");
        self.fallback(request).await
      }
    }
  }

  /// Offline page for documents, synthetic 408 for everything else.
  async fn fallback(&self, request: &Request) -> CacheResult<CachedResponse> {
    if request.destination == Destination::Document {
      let key = RequestKey::get(&self.config.offline_page);
      if let Some(page) = self.layer.lookup(&key).await {
        return CacheResult::offline_page(page.response, page.cached_at);
      }
      warn!(page = %self.config.offline_page, "Offline page is not cached");
    }
    CacheResult::synthetic(CachedResponse::offline_unavailable())
  }

  /// Handle a sync event delivered when connectivity returns.
  ///
  /// Only `background-feedback-sync` is recognized; it currently performs no work.
  pub async fn handle_sync(&self, tag: &str) -> SyncOutcome {
    if tag == BACKGROUND_FEEDBACK_SYNC {
      info!(tag, "Background feedback sync requested");
      SyncOutcome::Recognized
    } else {
      debug!(tag, "Ignoring unknown sync tag");
      SyncOutcome::Ignored
    }
  }
}
