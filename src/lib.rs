//! Offline resource cache manager.
//!
//! Serves intercepted page requests from versioned cache stores using
//! cache-first, stale-while-revalidate or network-first depending on the
//! resource, and degrades to an offline page or a synthetic 408 response
//! when neither cache nor network can answer.

pub mod cache;
pub mod config;
pub mod logging;
pub mod net;
pub mod worker;

pub use cache::{
  CacheResult, CacheSource, CacheStorage, CachedResponse, MemoryStorage, SqliteStorage,
};
pub use config::Config;
pub use net::{Destination, Fetcher, HttpFetcher, Request};
pub use worker::{Intercept, OfflineCacheManager, WorkerConfig};
