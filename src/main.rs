//! Track Cache - administration tool for the local reference-data cache
//!
//! Inspects and edits the cache file shared by time-tracking CLI invocations.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use track_cache::{Cache, CacheConfig};

/// Inspect and manage the local reference-data cache
#[derive(Parser, Debug)]
#[command(name = "track-cache")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Cache file path
    #[arg(short, long, global = true, env = "TRACK_CACHE_FILE")]
    file: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show entry count and counters
    Stats,
    /// List valid keys with their remaining TTL
    List,
    /// Print the cached value for a key
    Get { key: String },
    /// Cache a JSON value under a key
    Set {
        key: String,
        /// JSON payload
        value: String,
        /// Time-to-live in seconds
        #[arg(long, default_value_t = 300)]
        ttl: u64,
    },
    /// Remove a key
    Delete { key: String },
    /// Delete the cache file
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("track_cache=warn"),
        1 => EnvFilter::new("track_cache=info"),
        _ => EnvFilter::new("track_cache=debug"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = CacheConfig::from_env();
    if let Some(path) = cli.file {
        config.path = path;
    }
    debug!("Using cache file {}", config.path.display());
    let cache = Cache::new(&config);

    match cli.command {
        Command::Stats => {
            let stats = cache.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::List => {
            let store = cache.store().clone();
            let entries = tokio::task::spawn_blocking(move || store.entries()).await?;
            if entries.is_empty() {
                println!("Cache is empty.");
            } else {
                println!("{:<40} {:>12}", "KEY", "EXPIRES IN");
                println!("{}", "-".repeat(53));
                for entry in entries {
                    println!(
                        "{:<40} {:>11}s",
                        entry.key,
                        entry.ttl_remaining_ms / 1000
                    );
                }
            }
        }
        Command::Get { key } => match cache.get::<Value>(&key).await? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => {
                info!("No valid entry for {}", key);
                std::process::exit(1);
            }
        },
        Command::Set { key, value, ttl } => {
            let value: Value = serde_json::from_str(&value)
                .with_context(|| format!("value for {} is not valid JSON", key))?;
            cache.set(&key, &value, Duration::from_secs(ttl)).await;
        }
        Command::Delete { key } => cache.delete(&key).await,
        Command::Clear => {
            cache.clear().await;
            info!("Removed {}", config.path.display());
        }
    }

    Ok(())
}
