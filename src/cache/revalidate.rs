//! Detached network work.
//!
//! Background refreshes started by stale-while-revalidate, and the network
//! legs of the other strategies, run as detached tokio tasks so they complete
//! even when the request that started them has already been answered or
//! abandoned. Refresh outcomes are logged, counted and optionally forwarded
//! to a subscriber.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::RequestKey;

/// How a background refresh ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevalidationOutcome {
  /// The store now holds the fresh response
  Refreshed,
  /// The network answered with a status that is not cached
  NotCacheable(u16),
  /// The network leg failed
  FetchFailed(String),
  /// The network answered but writing to the store failed
  WriteFailed(String),
}

/// A finished background refresh.
#[derive(Debug, Clone)]
pub struct RevalidationEvent {
  pub key: RequestKey,
  pub outcome: RevalidationOutcome,
}

/// Snapshot of refresh counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevalidationStats {
  pub started: u64,
  pub refreshed: u64,
  pub not_cacheable: u64,
  pub fetch_failed: u64,
  pub write_failed: u64,
}

#[derive(Default)]
struct Counters {
  started: AtomicU64,
  refreshed: AtomicU64,
  not_cacheable: AtomicU64,
  fetch_failed: AtomicU64,
  write_failed: AtomicU64,
}

#[derive(Default)]
struct Inner {
  counters: Counters,
  subscriber: Mutex<Option<mpsc::UnboundedSender<RevalidationEvent>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Spawns and observes detached tasks. Cheap to clone.
#[derive(Clone, Default)]
pub struct RevalidationTracker {
  inner: Arc<Inner>,
}

impl RevalidationTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Receive an event for every refresh that finishes from now on.
  ///
  /// Only one subscriber is kept; subscribing again replaces the previous one.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RevalidationEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut subscriber) = self.inner.subscriber.lock() {
      *subscriber = Some(tx);
    }
    rx
  }

  /// Run `refresh` on a detached task.
  pub fn spawn<Fut>(&self, key: RequestKey, refresh: Fut)
  where
    Fut: Future<Output = RevalidationOutcome> + Send + 'static,
  {
    self.inner.counters.started.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::clone(&self.inner);

    let handle = tokio::spawn(async move {
      let outcome = refresh.await;
      inner.record(&key, &outcome);

      let subscriber = inner.subscriber.lock().ok().and_then(|s| s.clone());
      if let Some(tx) = subscriber {
        if tx.send(RevalidationEvent { key, outcome }).is_err() {
          // Receiver dropped
          if let Ok(mut s) = inner.subscriber.lock() {
            *s = None;
          }
        }
      }
    });

    self.track(handle);
  }

  /// Run `work` on a detached task and hand its output back through the
  /// returned receiver.
  ///
  /// Dropping the receiver does not cancel the work; `wait_idle` covers it.
  pub fn spawn_detached<T, Fut>(&self, work: Fut) -> oneshot::Receiver<T>
  where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
      // Nobody is waiting if the request was abandoned
      let _ = tx.send(work.await);
    });
    self.track(handle);
    rx
  }

  fn track(&self, handle: JoinHandle<()>) {
    if let Ok(mut tasks) = self.inner.tasks.lock() {
      tasks.retain(|t| !t.is_finished());
      tasks.push(handle);
    }
  }

  /// Wait until every detached task started so far has finished.
  pub async fn wait_idle(&self) {
    loop {
      let pending: Vec<JoinHandle<()>> = match self.inner.tasks.lock() {
        Ok(mut tasks) => std::mem::take(&mut *tasks),
        Err(_) => return,
      };
      if pending.is_empty() {
        return;
      }
      for task in pending {
        if let Err(e) = task.await {
          warn!(error = %e, "Detached task panicked");
        }
      }
    }
  }

  pub fn stats(&self) -> RevalidationStats {
    let c = &self.inner.counters;
    RevalidationStats {
      started: c.started.load(Ordering::Relaxed),
      refreshed: c.refreshed.load(Ordering::Relaxed),
      not_cacheable: c.not_cacheable.load(Ordering::Relaxed),
      fetch_failed: c.fetch_failed.load(Ordering::Relaxed),
      write_failed: c.write_failed.load(Ordering::Relaxed),
    }
  }
}

impl Inner {
  fn record(&self, key: &RequestKey, outcome: &RevalidationOutcome) {
    let c = &self.counters;
    match outcome {
      RevalidationOutcome::Refreshed => {
        c.refreshed.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Background refresh stored");
      }
      RevalidationOutcome::NotCacheable(status) => {
        c.not_cacheable.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, status, "Background refresh not cacheable");
      }
      RevalidationOutcome::FetchFailed(error) => {
        c.fetch_failed.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, error = %error, "Background refresh fetch failed");
      }
      RevalidationOutcome::WriteFailed(error) => {
        c.write_failed.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, error = %error, "Background refresh could not be stored");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn key() -> RequestKey {
    RequestKey::parse("GET", "https://example.org/img/a.png").unwrap()
  }

  #[tokio::test]
  async fn test_wait_idle_and_stats() {
    let tracker = RevalidationTracker::new();
    tracker.spawn(key(), async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      RevalidationOutcome::Refreshed
    });
    tracker.spawn(key(), async { RevalidationOutcome::FetchFailed("offline".into()) });
    tracker.spawn(key(), async { RevalidationOutcome::NotCacheable(404) });

    tracker.wait_idle().await;

    let stats = tracker.stats();
    assert_eq!(stats.started, 3);
    assert_eq!(stats.refreshed, 1);
    assert_eq!(stats.fetch_failed, 1);
    assert_eq!(stats.not_cacheable, 1);
    assert_eq!(stats.write_failed, 0);
  }

  #[tokio::test]
  async fn test_subscriber_receives_outcomes() {
    let tracker = RevalidationTracker::new();
    let mut events = tracker.subscribe();

    tracker.spawn(key(), async { RevalidationOutcome::WriteFailed("disk full".into()) });
    tracker.wait_idle().await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.key, key());
    assert_eq!(
      event.outcome,
      RevalidationOutcome::WriteFailed("disk full".into())
    );
    assert_eq!(tracker.stats().write_failed, 1);
  }

  #[tokio::test]
  async fn test_detached_work_survives_dropped_receiver() {
    let tracker = RevalidationTracker::new();
    let done = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&done);
    let rx = tracker.spawn_detached(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      counter.fetch_add(1, Ordering::SeqCst);
      7
    });
    drop(rx);

    tracker.wait_idle().await;
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.stats().started, 0);
    assert_eq!(tracker.spawn_detached(async { 42 }).await.unwrap(), 42);
  }

  #[tokio::test]
  async fn test_dropped_subscriber_does_not_stop_refresh() {
    let tracker = RevalidationTracker::new();
    drop(tracker.subscribe());

    tracker.spawn(key(), async { RevalidationOutcome::Refreshed });
    tracker.wait_idle().await;
    assert_eq!(tracker.stats().refreshed, 1);
  }
}
