use cache_core::Cache;
use cache_core::ports::StorageFactory;
use clap::{Parser, Subcommand};
use shared::config::{BackendConfig, CacheConfig};
use shared::{Error, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::time::Duration;
use storage_engine::{RedisCache, SledCache, UnifiedStorageFactory, spawn_expiry_sweeper};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and maintain a cache store")]
struct Args {
    /// Key prefix to operate on; overrides CACHE_PREFIX
    #[arg(long)]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Show backend, key count and store footprint
    Stats,
    /// List keys, optionally filtered by a `*` pattern
    Keys {
        pattern: Option<String>,
        /// Stop after this many keys (0 = default page size)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the value stored under a key
    Get { key: String },
    /// Print the remaining time to live of a key
    Ttl { key: String },
    /// Delete a key
    Del { key: String },
    /// Delete every key, or only those matching a pattern
    Empty { pattern: Option<String> },
    /// Write a snapshot of the embedded store to a file
    Backup { file: PathBuf },
    /// Load a snapshot into the embedded store
    Restore { file: PathBuf },
    /// Purge expired records from the embedded store
    Gc,
    /// Purge expired records periodically until interrupted
    Sweep {
        /// Seconds between sweeps; defaults to CACHE_GC_INTERVAL_SECS or 60
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let mut config = CacheConfig::from_env()?;
    if let Some(prefix) = args.prefix {
        config.prefix = prefix;
    }

    run(args.command, &config).await?;
    Ok(())
}

async fn run(command: Command, config: &CacheConfig) -> Result<()> {
    match command {
        Command::Stats => stats(config).await,
        Command::Keys { pattern, limit } => {
            let cache = UnifiedStorageFactory.create_from_config(config)?;
            let patterns: Vec<&str> = pattern.as_deref().into_iter().collect();
            let keys = match limit {
                Some(limit) => cache.keys_with_batch_size(limit, &patterns).await?,
                None => cache.keys(&patterns).await?,
            };
            for key in &keys {
                println!("{}", key);
            }
            info!("{} keys", keys.len());
            cache.close().await
        }
        Command::Get { key } => {
            let cache = UnifiedStorageFactory.create_from_config(config)?;
            let value = cache.get(&key).await?;
            let pretty = serde_json::to_string_pretty(&value)
                .map_err(|e| Error::Encoding(format!("failed to print {}: {}", key, e)))?;
            println!("{}", pretty);
            cache.close().await
        }
        Command::Ttl { key } => {
            let cache = UnifiedStorageFactory.create_from_config(config)?;
            match cache.ttl(&key).await? {
                Duration::ZERO => println!("no expiry"),
                ttl => println!("{:.3}s", ttl.as_secs_f64()),
            }
            cache.close().await
        }
        Command::Del { key } => {
            let cache = UnifiedStorageFactory.create_from_config(config)?;
            cache.delete(&key).await?;
            info!("Deleted {}", key);
            cache.close().await
        }
        Command::Empty { pattern } => {
            let cache = UnifiedStorageFactory.create_from_config(config)?;
            match pattern {
                Some(pattern) => cache.empty_by_match(&pattern).await?,
                None => cache.empty().await?,
            }
            info!("Emptied prefix {}", cache.prefix());
            cache.close().await
        }
        Command::Backup { file } => {
            let cache = open_embedded(config, "backup")?;
            let out = File::create(&file).map_err(|e| {
                Error::InvalidArgument(format!("cannot create {}: {}", file.display(), e))
            })?;
            let written = cache.backup(BufWriter::new(out))?;
            println!("{} records written to {}", written, file.display());
            cache.close().await
        }
        Command::Restore { file } => {
            let cache = open_embedded(config, "restore")?;
            let input = File::open(&file).map_err(|e| {
                Error::InvalidArgument(format!("cannot open {}: {}", file.display(), e))
            })?;
            let loaded = cache.restore(BufReader::new(input))?;
            println!("{} records loaded from {}", loaded, file.display());
            cache.close().await
        }
        Command::Gc => {
            let cache = open_embedded(config, "gc")?;
            let purged = cache.run_gc()?;
            println!("{} expired records purged", purged);
            Ok(())
        }
        Command::Sweep { interval_secs } => {
            let cache = open_embedded(config, "sweep")?;
            let interval = sweep_interval(interval_secs, config);
            let sweeper = spawn_expiry_sweeper(cache.clone(), interval);

            shutdown_signal().await;
            sweeper.abort();
            cache.sync()?;
            Ok(())
        }
    }
}

async fn stats(config: &CacheConfig) -> Result<()> {
    match &config.backend {
        BackendConfig::Embedded(embedded) => {
            let cache = SledCache::open(&config.prefix, embedded)?;
            let keys = cache.keys(&[]).await?.len();
            let size = cache.size()?;
            println!("backend:    {}", cache.backend());
            println!("prefix:     {}", cache.prefix());
            println!("keys:       {}", keys);
            println!("entries:    {}", size.entries);
            println!("disk bytes: {}", size.disk_bytes);
            Ok(())
        }
        BackendConfig::Remote(remote) => {
            let cache = RedisCache::connect(&config.prefix, remote)?;
            cache.ping().await?;
            let keys = cache.keys(&[]).await?.len();
            let status = cache.status();
            println!("backend:    {}", cache.backend());
            println!("prefix:     {}", cache.prefix());
            println!("keys:       {}", keys);
            println!("pool:       {}/{} connections", status.size, status.max_size);
            cache.close().await
        }
    }
}

fn open_embedded(config: &CacheConfig, command: &str) -> Result<SledCache> {
    match &config.backend {
        BackendConfig::Embedded(embedded) => SledCache::open(&config.prefix, embedded),
        BackendConfig::Remote(_) => Err(Error::InvalidArgument(format!(
            "{} requires the embedded backend (CACHE=sled)",
            command
        ))),
    }
}

fn sweep_interval(interval_secs: Option<u64>, config: &CacheConfig) -> Duration {
    let configured = match &config.backend {
        BackendConfig::Embedded(embedded) => embedded.gc_interval,
        BackendConfig::Remote(_) => None,
    };
    interval_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .or(configured)
        .unwrap_or(DEFAULT_SWEEP_INTERVAL)
}

// Graceful shutdown handler
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
}
