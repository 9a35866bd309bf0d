use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use swcache::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use swcache::config::Config;
use swcache::net::{Destination, HttpFetcher, Request};
use swcache::worker::{Intercept, LifecycleHooks, OfflineCacheManager, SyncOutcome};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline resource cache manager for a static site")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Site origin, overrides the configured one
  #[arg(short, long)]
  origin: Option<String>,

  /// Keep cache stores in memory for this run only
  #[arg(long)]
  ephemeral: bool,

  /// Enable debug logging
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the static store with every listed asset
  Install,
  /// Delete stores left over from previous versions
  Activate,
  /// Run one request through the interceptor
  Fetch {
    /// Absolute URL, or a path relative to the origin
    url: String,
    /// Request destination (document, image, script, style, font, ...)
    #[arg(short, long, default_value = "document")]
    destination: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Print the response body
    #[arg(long)]
    body: bool,
  },
  /// List cache stores and their entry counts
  Stores,
  /// Deliver a sync event with the given tag
  Sync { tag: String },
}

/// Host side of the lifecycle; there are no other instances to hand over from.
struct CliHooks;

impl LifecycleHooks for CliHooks {
  fn skip_waiting(&self) {
    info!("Activating without waiting for previous instances");
  }

  fn claim_clients(&self) {
    info!("Claiming open clients");
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin.clone() {
    Config { origin, ..config }
  } else {
    config
  };

  let _log_guard = swcache::logging::init(config.log_file.as_deref(), args.verbose)?;

  if args.ephemeral {
    run(args, config, Arc::new(MemoryStorage::new())).await
  } else {
    let storage = match &config.cache_path {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    run(args, config, Arc::new(storage)).await
  }
}

async fn run<S: CacheStorage + 'static>(args: Args, config: Config, storage: Arc<S>) -> Result<()> {
  let worker_config = config.worker_config()?;
  let fetcher = HttpFetcher::new(worker_config.origin.clone(), worker_config.fetch_timeout)?;
  let origin = worker_config.origin.clone();
  let manager = OfflineCacheManager::new(worker_config, Arc::clone(&storage), Arc::new(fetcher))
    .with_hooks(Arc::new(CliHooks));

  match args.command {
    Command::Install => {
      let report = manager.setup().await?;
      println!("Cached {} assets in {}", report.cached, report.store);
    }
    Command::Activate => {
      let report = manager.activate().await;
      for name in &report.deleted {
        println!("deleted {}", name);
      }
      for (name, reason) in &report.failed {
        println!("failed  {} ({})", name, reason);
      }
      if report.deleted.is_empty() && report.failed.is_empty() {
        println!("No stale stores");
      }
    }
    Command::Fetch {
      url,
      destination,
      method,
      body,
    } => {
      let url = origin
        .join(&url)
        .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
      let request = Request::new(&method, url, Destination::parse(&destination));

      match manager.handle_request(&request).await {
        Intercept::Passthrough => println!("Not intercepted: {} {}", request.method, request.url),
        Intercept::Respond(result) => {
          let response = &result.data;
          println!(
            "{} {} ({} bytes) from {}",
            response.status,
            response.status_text,
            response.body.len(),
            result.source
          );
          if let Some(cached_at) = result.cached_at {
            println!("cached at {}", cached_at.to_rfc3339());
          }
          if body {
            println!("{}", String::from_utf8_lossy(&response.body));
          }
        }
      }

      // Let background refreshes land before exiting
      manager.revalidations().wait_idle().await;
      let stats = manager.revalidations().stats();
      if stats.started > 0 {
        info!(?stats, "Background refreshes finished");
      }
    }
    Command::Stores => {
      let names = storage.store_names()?;
      if names.is_empty() {
        println!("No cache stores");
      }
      for name in names {
        let marker = if name == config.static_store() || name == config.dynamic_store() {
          ""
        } else {
          " (stale)"
        };
        println!("{}\t{} entries{}", name, storage.keys(&name)?.len(), marker);
      }
    }
    Command::Sync { tag } => match manager.handle_sync(&tag).await {
      SyncOutcome::Recognized => println!("Handled sync '{}'", tag),
      SyncOutcome::Ignored => println!("Unknown sync tag '{}'", tag),
    },
  }

  Ok(())
}
