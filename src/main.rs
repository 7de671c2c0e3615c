mod cache;
mod config;
mod manifest;
mod server;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use url::Url;

use cache::{CacheStorage, SqliteStorage};
use config::Config;
use worker::{EventDispatcher, FetchRequest, HttpNetwork, OfflineCacheController, ResponseSource};

type Worker = OfflineCacheController<SqliteStorage, HttpNetwork>;

#[derive(Parser, Debug)]
#[command(name = "eosd-web")]
#[command(about = "Serve the EoSD web build and manage its offline asset cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/eosd-web/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Cache database to use instead of the configured one
  #[arg(long, global = true)]
  cache_db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Serve the build with cross-origin isolation headers
  Serve {
    #[arg(long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    /// Deployment root
    #[arg(short, long)]
    root: Option<PathBuf>,
  },
  /// Pre-cache a variant's manifest and evict every other cache generation
  Install {
    variant: String,
    /// Origin to fetch assets from
    #[arg(long)]
    origin: Option<Url>,
  },
  /// Fetch paths through a variant's cache worker
  Fetch {
    variant: String,
    #[arg(required = true)]
    paths: Vec<String>,
    #[arg(long)]
    origin: Option<Url>,
  },
  /// List cache generations and their entries
  Caches,
  /// Print build variant manifests
  Manifest { variant: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(path) = args.cache_db {
    config.cache_db = Some(path);
  }

  let _guard = init_tracing(config.log_file.as_deref())?;

  match args.command {
    Command::Serve { host, port, root } => {
      if let Some(host) = host {
        config.server.host = host;
      }
      if let Some(port) = port {
        config.server.port = port;
      }
      if let Some(root) = root {
        config.server.root = root;
      }
      server::run(&config.server).await
    }
    Command::Install { variant, origin } => {
      if let Some(origin) = origin {
        config.origin = Some(origin);
      }
      install(&config, &variant).await
    }
    Command::Fetch {
      variant,
      paths,
      origin,
    } => {
      if let Some(origin) = origin {
        config.origin = Some(origin);
      }
      fetch(&config, &variant, &paths).await
    }
    Command::Caches => list_caches(&config),
    Command::Manifest { variant } => print_manifests(&config, variant.as_deref()),
  }
}

/// Log to stderr, and to `log_file` as well when configured.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  use tracing_subscriber::{fmt, prelude::*, EnvFilter};

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn open_storage(config: &Config) -> Result<Arc<SqliteStorage>> {
  let storage = match &config.cache_db {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open_default()?,
  };
  Ok(Arc::new(storage))
}

/// Cache worker for `variant` and the network it falls back to.
fn worker(
  config: &Config,
  variant: &str,
  storage: &Arc<SqliteStorage>,
) -> Result<(Arc<Worker>, Arc<HttpNetwork>)> {
  let manifest = config.variant(variant)?.clone();
  let network = Arc::new(HttpNetwork::new(config.request_timeout())?);
  let worker = Arc::new(OfflineCacheController::new(
    Arc::clone(storage),
    Arc::clone(&network),
    manifest,
    config.origin()?,
  ));
  Ok((worker, network))
}

async fn install(config: &Config, variant: &str) -> Result<()> {
  let storage = open_storage(config)?;
  let (worker, network) = worker(config, variant, &storage)?;
  let sw = EventDispatcher::new(worker, network);
  let manifest = config.variant(variant)?;
  let origin = config.origin()?;

  let evicted = sw.install().await?;

  println!("{} ({})", manifest.cache_name, sw.state());
  for asset in &manifest.assets {
    let url = origin
      .join(asset)
      .map_err(|e| eyre!("Invalid asset path {}: {}", asset, e))?;
    let cached = storage.match_in(&manifest.cache_name, &FetchRequest::get(url))?;
    let mark = if cached.is_some() { "cached" } else { "missing" };
    println!("  {:<8} {}", mark, asset);
  }
  for stale in evicted {
    println!("evicted {}", stale);
  }
  Ok(())
}

async fn fetch(config: &Config, variant: &str, paths: &[String]) -> Result<()> {
  let storage = open_storage(config)?;
  let (worker, network) = worker(config, variant, &storage)?;
  // Installs unless this generation was activated by an earlier run
  let sw = EventDispatcher::start(worker, network).await?;
  let origin = config.origin()?;

  let mut pending = Vec::new();
  for path in paths {
    let url = origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;
    pending.push((url.clone(), sw.spawn_fetch(FetchRequest::get(url))));
  }

  for (url, handle) in pending {
    let result = handle
      .await
      .map_err(|e| eyre!("Fetch task for {} failed: {}", url, e))?;
    match result {
      Ok(response) => {
        let source = match response.source {
          ResponseSource::Cache => "cache",
          ResponseSource::Network => "network",
        };
        println!(
          "{} {:>7} {:>10} {:<24} {}",
          response.status,
          source,
          response.body.len(),
          response.header("content-type").unwrap_or("-"),
          url
        );
      }
      Err(e) => println!("ERR {} ({})", url, e),
    }
  }

  sw.settle().await;
  Ok(())
}

fn list_caches(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  let names = storage.keys()?;
  if names.is_empty() {
    println!("no caches");
    return Ok(());
  }

  for name in names {
    let entries = storage.entries(&name)?;
    println!("{} ({} entries)", name, entries.len());
    for entry in entries {
      println!(
        "  {} {} {:>10} {} {} {}",
        entry.method,
        entry.status,
        entry.size,
        entry.body_sha256.get(..12).unwrap_or(&entry.body_sha256),
        entry.stored_at.format("%Y-%m-%d %H:%M:%S"),
        entry.url
      );
    }
  }
  Ok(())
}

fn print_manifests(config: &Config, variant: Option<&str>) -> Result<()> {
  let selected: Vec<_> = match variant {
    Some(name) => vec![(name.to_string(), config.variant(name)?.clone())],
    None => config
      .variants
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect(),
  };

  for (name, manifest) in selected {
    let yaml = serde_yaml::to_string(&manifest)
      .map_err(|e| eyre!("Failed to serialize manifest {}: {}", name, e))?;
    println!("# {}\n{}", name, yaml);
  }
  Ok(())
}
