use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use esi_sync::cache::{ExpiryCache, ExpiryConfig, KvStore, MemoryStorage, SqliteStorage};
use esi_sync::config::Config;
use esi_sync::esi::{EnvTokenSource, EsiClient, RemoteFetch};
use esi_sync::logging;
use esi_sync::owner::{parse_owner_key, OwnerDirectory, OwnerSet};
use esi_sync::resources::{Blueprints, Clones, JsonResource, StructureNotice, Structures};
use esi_sync::store::{OwnerStore, SyncedStore};

#[derive(Parser, Debug)]
#[command(name = "esi-sync")]
#[command(about = "Keep per-character and per-corporation ESI data fresh")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/esi-sync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep everything in memory instead of the SQLite cache
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Debug logging unless RUST_LOG is set
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Refresh stale data, then keep refreshing until Ctrl-C
  Sync {
    /// Refresh stale data once and exit
    #[arg(long)]
    once: bool,
  },
  /// Show every tracked endpoint and when it goes stale
  Status,
  /// Drop expiry entries of owners no longer configured
  Prune,
  /// Forget cached state for one owner, or for everyone
  Clear {
    /// Owner key, e.g. character-2112625428
    #[arg(long)]
    owner: Option<String>,
  },
}

/// Everything a command needs, wired from configuration.
struct Runtime {
  cache: ExpiryCache,
  owners: Arc<OwnerSet>,
  structures: Arc<OwnerStore<Structures>>,
  stores: Vec<Arc<dyn SyncedStore>>,
}

impl Runtime {
  fn new(config: &Config, ephemeral: bool) -> Result<Self> {
    let storage: Arc<dyn KvStore> = if ephemeral {
      Arc::new(MemoryStorage::new())
    } else {
      match &config.database {
        Some(path) => Arc::new(SqliteStorage::open_at(path)?),
        None => Arc::new(SqliteStorage::open()?),
      }
    };

    let owners = Arc::new(OwnerSet::new(config.owners()?));
    let cache = ExpiryCache::new(
      Arc::clone(&storage),
      owners.clone(),
      ExpiryConfig::from(&config.refresh),
    );
    let fetcher: Arc<dyn RemoteFetch> =
      Arc::new(EsiClient::new(&config.esi, Arc::new(EnvTokenSource))?);

    let structures = OwnerStore::new(
      Structures::new(Arc::clone(&fetcher)),
      cache.clone(),
      Arc::clone(&storage),
      owners.clone(),
    );
    let mut stores: Vec<Arc<dyn SyncedStore>> = vec![
      OwnerStore::new(
        Clones::new(Arc::clone(&fetcher)),
        cache.clone(),
        Arc::clone(&storage),
        owners.clone(),
      ),
      OwnerStore::new(
        Blueprints::new(Arc::clone(&fetcher)),
        cache.clone(),
        Arc::clone(&storage),
        owners.clone(),
      ),
      structures.clone(),
    ];
    for resource in &config.resources {
      stores.push(OwnerStore::new(
        JsonResource::new(resource.clone(), Arc::clone(&fetcher)),
        cache.clone(),
        Arc::clone(&storage),
        owners.clone(),
      ));
    }

    Ok(Self {
      cache,
      owners,
      structures,
      stores,
    })
  }

  async fn init(&self) {
    for store in &self.stores {
      store.init().await;
    }
    self.cache.init().await;
  }

  fn owner_keys(&self) -> Vec<String> {
    self.owners.owners().iter().map(|o| o.key()).collect()
  }

  async fn shutdown(&self) -> Result<()> {
    self.cache.pause();
    self.cache.wait_idle().await;
    let written = self.cache.flush().await?;
    info!(entries = written, "Expiry cache flushed");
    self.cache.dispose();
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(None, args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let runtime = Runtime::new(&config, args.ephemeral)?;

  match args.command {
    Command::Sync { once: true } => sync_once(&runtime).await,
    Command::Sync { once: false } => sync_forever(&runtime).await,
    Command::Status => status(&runtime).await,
    Command::Prune => prune(&runtime).await,
    Command::Clear { owner } => clear(&runtime, owner.as_deref()).await,
  }
}

async fn sync_once(runtime: &Runtime) -> Result<()> {
  // Batch updates do the work here; the queue would only duplicate it
  runtime.cache.pause();
  runtime.init().await;

  for store in &runtime.stores {
    store.update(false).await;
  }

  for store in &runtime.stores {
    let summary = store.summary();
    match &summary.update_error {
      Some(error) => println!("{:<20} {:>3} owner(s)  {}", summary.name, summary.owners, error),
      None => println!("{:<20} {:>3} owner(s)", summary.name, summary.owners),
    }
  }
  print_notices(runtime);

  runtime.shutdown().await
}

async fn sync_forever(runtime: &Runtime) -> Result<()> {
  runtime.init().await;
  let keys = runtime.owner_keys();
  runtime.cache.queue_missing_endpoints(&keys);
  info!(owners = keys.len(), "Syncing, press Ctrl-C to stop");

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  info!("Stopping");
  runtime.shutdown().await?;
  print_notices(runtime);
  Ok(())
}

async fn status(runtime: &Runtime) -> Result<()> {
  runtime.cache.pause();
  runtime.cache.init().await;

  let now = Utc::now();
  let mut entries: Vec<_> = runtime.cache.entries().into_iter().collect();
  entries.sort_by(|a, b| a.0.cmp(&b.0));
  if entries.is_empty() {
    println!("No tracked endpoints");
  }
  for (key, expiry) in entries {
    let remaining = expiry.expires_at - now;
    let when = if remaining.num_seconds() > 0 {
      format!("fresh for {}m{:02}s", remaining.num_minutes(), remaining.num_seconds() % 60)
    } else {
      "stale".to_string()
    };
    println!(
      "{:<60} {:<18} {}",
      key,
      when,
      expiry.etag.as_deref().unwrap_or("-")
    );
  }

  runtime.cache.dispose();
  Ok(())
}

async fn prune(runtime: &Runtime) -> Result<()> {
  runtime.cache.pause();
  runtime.cache.init().await;
  let removed = runtime.cache.prune_orphaned().await;
  println!("Removed {} orphaned expiry entries", removed);
  runtime.cache.dispose();
  Ok(())
}

async fn clear(runtime: &Runtime, owner: Option<&str>) -> Result<()> {
  runtime.cache.pause();
  runtime.init().await;

  match owner {
    Some(key) => {
      let (owner_type, id) = parse_owner_key(key)?;
      let removed = runtime.cache.clear_for_owner(key).await;
      for store in &runtime.stores {
        store.remove_for_owner(owner_type, id).await;
      }
      println!("Cleared {} ({} expiry entries)", key, removed);
    }
    None => {
      for store in &runtime.stores {
        store.clear().await;
      }
      runtime.cache.clear().await;
      println!("Cleared all cached data");
    }
  }

  runtime.cache.dispose();
  Ok(())
}

fn print_notices(runtime: &Runtime) {
  for (owner, notice) in runtime.structures.source().take_notices() {
    match notice {
      StructureNotice::StateChanged { name, from, to, .. } => {
        println!("{}: {} {} -> {}", owner, name, from, to)
      }
      StructureNotice::LowFuel {
        name, fuel_expires, ..
      } => println!("{}: {} low on fuel, runs out {}", owner, name, fuel_expires),
      StructureNotice::Removed { name, .. } => println!("{}: {} removed", owner, name),
    }
  }
}
