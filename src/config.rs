use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::worker::WorkerConfig;

/// Critical assets of the site, relative to its origin.
const DEFAULT_STATIC_ASSETS: &[&str] = &[
  "./",
  "./index.html",
  "./versiculos.html",
  "./livros-da-biblia.html",
  "./feedback.html",
  "./feedback-admin.html",
  "./resources.html",
  "./fe.html",
  "./css/estilo.css",
  "./js/core.js",
  "./js/search.js",
  "./js/gallery.js",
  "./js/feedback.js",
  "./manifest.json",
  "./favicon.svg",
  "./offline.html",
  "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css",
  "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/js/bootstrap.bundle.min.js",
];

const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
  "cdn.jsdelivr.net",
  "fonts.googleapis.com",
  "fonts.gstatic.com",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the site is served from; relative assets resolve against it
  pub origin: String,
  pub static_prefix: String,
  pub static_version: u32,
  pub dynamic_prefix: String,
  pub dynamic_version: u32,
  pub offline_page: String,
  pub static_assets: Vec<String>,
  /// Cross-origin hosts cached like static assets (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_list")]
  pub allowed_hosts: Vec<String>,
  pub fetch_timeout_secs: u64,
  /// SQLite database path (defaults to $XDG_DATA_HOME/swcache/cache.db)
  pub cache_path: Option<PathBuf>,
  /// Write logs to this file instead of stderr
  pub log_file: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080/".to_string(),
      static_prefix: "biblia-mobile".to_string(),
      static_version: 4,
      dynamic_prefix: "biblia-dynamic".to_string(),
      dynamic_version: 2,
      offline_page: "./offline.html".to_string(),
      static_assets: DEFAULT_STATIC_ASSETS.iter().map(|s| s.to_string()).collect(),
      allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|s| s.to_string()).collect(),
      fetch_timeout_secs: 8,
      cache_path: None,
      log_file: None,
    }
  }
}

fn deserialize_lowercase_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// Built-in defaults are used when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn static_store(&self) -> String {
    WorkerConfig::store_name(&self.static_prefix, self.static_version)
  }

  pub fn dynamic_store(&self) -> String {
    WorkerConfig::store_name(&self.dynamic_prefix, self.dynamic_version)
  }

  /// Resolve and validate into the manager's configuration.
  pub fn worker_config(&self) -> Result<WorkerConfig> {
    let origin =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    if origin.cannot_be_a_base() {
      return Err(eyre!("Origin '{}' is not a base URL", self.origin));
    }

    let resolve = |asset: &str| {
      origin
        .join(asset)
        .map_err(|e| eyre!("Invalid asset '{}': {}", asset, e))
    };

    let static_assets = self
      .static_assets
      .iter()
      .map(|a| resolve(a))
      .collect::<Result<Vec<_>>>()?;
    let offline_page = resolve(&self.offline_page)?;

    if !static_assets.contains(&offline_page) {
      return Err(eyre!(
        "Offline page {} must be listed in static_assets",
        self.offline_page
      ));
    }
    if self.static_store() == self.dynamic_store() {
      return Err(eyre!(
        "Static and dynamic stores must have different names ({})",
        self.static_store()
      ));
    }
    if self.fetch_timeout_secs == 0 {
      return Err(eyre!("fetch_timeout_secs must be greater than zero"));
    }

    Ok(WorkerConfig {
      origin,
      static_store: self.static_store(),
      dynamic_store: self.dynamic_store(),
      static_assets,
      offline_page,
      allowed_hosts: self.allowed_hosts.clone(),
      fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    let worker = config.worker_config().unwrap();
    assert_eq!(worker.static_store, "biblia-mobile-v4");
    assert_eq!(worker.dynamic_store, "biblia-dynamic-v2");
    assert_eq!(worker.static_assets.len(), DEFAULT_STATIC_ASSETS.len());
    assert_eq!(worker.offline_page.as_str(), "http://localhost:8080/offline.html");
    assert_eq!(worker.fetch_timeout, Duration::from_secs(8));
  }

  #[test]
  fn test_yaml_overrides_and_lowercases_hosts() {
    let config = Config::from_yaml(
      r#"
origin: https://example.org/site/
static_version: 5
allowed_hosts: [CDN.Example.COM]
static_assets: ["./", "./offline.html", "/root.css"]
"#,
    )
    .unwrap();

    assert_eq!(config.static_prefix, "biblia-mobile");
    assert_eq!(config.allowed_hosts, vec!["cdn.example.com".to_string()]);

    let worker = config.worker_config().unwrap();
    assert_eq!(worker.static_store, "biblia-mobile-v5");
    let assets: Vec<&str> = worker.static_assets.iter().map(|u| u.as_str()).collect();
    assert_eq!(
      assets,
      vec![
        "https://example.org/site/",
        "https://example.org/site/offline.html",
        "https://example.org/root.css",
      ]
    );
  }

  #[test]
  fn test_offline_page_must_be_static() {
    let config = Config {
      static_assets: vec!["./index.html".to_string()],
      ..Config::default()
    };
    assert!(config.worker_config().is_err());
  }

  #[test]
  fn test_store_names_must_differ() {
    let config = Config {
      dynamic_prefix: "biblia-mobile".to_string(),
      dynamic_version: 4,
      ..Config::default()
    };
    assert!(config.worker_config().is_err());
  }

  #[test]
  fn test_missing_explicit_file_is_error() {
    let missing = std::env::temp_dir().join("swcache-does-not-exist.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }
}
