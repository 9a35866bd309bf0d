//! Named cache stores and the caching strategies built on top of them.
//!
//! This module provides:
//! - A storage abstraction holding any number of named stores of captured responses
//! - In-memory and SQLite backends
//! - The three serving strategies (cache-first, stale-while-revalidate, network-first)
//! - Tracking of detached background refreshes

mod layer;
mod revalidate;
mod storage;
mod types;

pub use layer::CacheLayer;
pub use revalidate::{
  RevalidationEvent, RevalidationOutcome, RevalidationStats, RevalidationTracker,
};
pub use storage::{run_blocking, CacheStorage, MemoryStorage, SqliteStorage};
pub use types::{
  CacheResult, CacheSource, CachedEntry, CachedResponse, RequestKey, ResponseKind, OFFLINE_BODY,
};
