//! Install/activate lifecycle of the cache manager.

/// Lifecycle state, following the service worker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
  /// Constructed, setup not yet run
  #[default]
  Parsed,
  Installing,
  /// Static store populated; waiting to activate
  Installed,
  Activating,
  /// Old stores cleaned up; controlling clients
  Activated,
  /// Setup failed; this instance is not offline-ready
  Redundant,
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

/// Host primitives invoked at the end of setup and activation.
pub trait LifecycleHooks: Send + Sync {
  /// Take over interception immediately instead of waiting for older instances.
  fn skip_waiting(&self) {}

  /// Govern already-open pages without a reload.
  fn claim_clients(&self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}
