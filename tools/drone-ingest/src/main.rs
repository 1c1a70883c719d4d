// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! drone-ingest - Drone telemetry ingestion service
//!
//! Receives device state over TCP, merges it into a SQLite database and
//! writes undeliverable payloads to a dead-letter file.
//!
//! # Usage
//!
//! ```bash
//! # Serve on the default port
//! drone-ingest --db drone-state.db
//!
//! # Query persisted state
//! drone-ingest --db drone-state.db status drone-42
//! drone-ingest --db drone-state.db list
//! drone-ingest --db drone-state.db stats
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drone_telemetry::{
    CancellationToken, IngestConfig, IngestServer, IngestionProcessor, JsonlDeadLetterSink,
    SqliteStore, StateStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Drone telemetry ingestion service
#[derive(Parser, Debug)]
#[command(name = "drone-ingest")]
#[command(about = "Drone telemetry ingestion service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "DRONE_INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(short, long, env = "DRONE_INGEST_LISTEN")]
    listen: Option<String>,

    /// Database path (SQLite file)
    #[arg(short, long, env = "DRONE_INGEST_DB")]
    db: Option<PathBuf>,

    /// Dead-letter file (JSON lines)
    #[arg(long, env = "DRONE_INGEST_DEAD_LETTERS")]
    dead_letters: Option<PathBuf>,

    /// Largest batch handed to the processor
    #[arg(long)]
    batch_size: Option<usize>,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the persisted state of one device
    Status {
        /// Device identifier
        device_id: String,
    },
    /// List known devices
    List,
    /// Show store and dead-letter counts
    Stats,
    /// Print dead-lettered payloads
    DeadLetters {
        /// Show at most this many entries (most recent last)
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "ingest.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = build_config(&args)?;

    if let Some(cmd) = args.command {
        return handle_command(cmd, &config);
    }

    serve(config).await
}

/// Defaults, then file, then environment and command line.
fn build_config(args: &Args) -> Result<IngestConfig> {
    let mut config = match &args.config {
        Some(path) => IngestConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => IngestConfig::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(db) = &args.db {
        config.database = db.clone();
    }
    if let Some(path) = &args.dead_letters {
        config.dead_letter_path = path.clone();
    }
    if let Some(size) = args.batch_size {
        config.batch_size = size;
    }
    if let Some(interval) = args.stats_interval {
        config.stats_interval_secs = interval;
    }

    config.validate()?;
    Ok(config)
}

async fn serve(config: IngestConfig) -> Result<()> {
    let store = SqliteStore::open(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database.display()))?;
    let sink = JsonlDeadLetterSink::open(&config.dead_letter_path).with_context(|| {
        format!(
            "Failed to open dead-letter file {}",
            config.dead_letter_path.display()
        )
    })?;
    let processor = Arc::new(IngestionProcessor::new(Arc::new(store), Arc::new(sink)));

    tracing::info!("Drone ingestion service starting...");
    tracing::info!("  Database: {}", config.database.display());
    tracing::info!("  Dead letters: {}", config.dead_letter_path.display());
    tracing::info!("  Batch size: {}", config.batch_size);

    let server = IngestServer::bind(
        config.listen.as_str(),
        Arc::clone(&processor),
        config.server_settings(),
    )
    .await?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down...");
            signal_token.cancel();
        }
    });

    if config.stats_interval_secs > 0 {
        let processor = Arc::clone(&processor);
        let token = token.clone();
        let interval = Duration::from_secs(config.stats_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let s = processor.stats();
                        tracing::info!(
                            "received={} stored={} new_devices={} decode_failures={} merge_failures={}",
                            s.received,
                            s.stored,
                            s.created,
                            s.decode_failures,
                            s.merge_failures
                        );
                    }
                }
            }
        });
    }

    let stats = server.run(token).await?;

    println!("\nFinal Statistics:");
    println!("  Received:             {}", stats.received);
    println!("  Stored:               {}", stats.stored);
    println!("  New devices:          {}", stats.created);
    println!("  Decode failures:      {}", stats.decode_failures);
    println!("  Merge failures:       {}", stats.merge_failures);
    println!("  Dead-letter failures: {}", stats.dead_letter_failures);
    Ok(())
}

fn handle_command(cmd: Commands, config: &IngestConfig) -> Result<()> {
    match cmd {
        Commands::GenConfig { output } => {
            let example = IngestConfig::builder()
                .listen("0.0.0.0:7400")
                .database("/var/lib/drone/state.db")
                .dead_letter_path("/var/lib/drone/dead-letters.jsonl")
                .build();
            std::fs::write(&output, example.to_toml()?)?;
            println!("Generated configuration: {}", output.display());
        }
        Commands::Status { device_id } => {
            let store = open_for_query(&config.database)?;
            match store.get(&device_id)? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => anyhow::bail!("Device '{}' not found", device_id),
            }
        }
        Commands::List => {
            let store = open_for_query(&config.database)?;
            let ids = store.list_device_ids()?;
            println!("{} devices:", ids.len());
            for id in ids {
                println!("  {}", id);
            }
        }
        Commands::Stats => {
            let store = open_for_query(&config.database)?;
            println!("Database: {}", config.database.display());
            println!("  Devices: {}", store.count()?);
            let dead = if config.dead_letter_path.exists() {
                JsonlDeadLetterSink::read_all(&config.dead_letter_path)?.len()
            } else {
                0
            };
            println!("  Dead letters: {}", dead);
        }
        Commands::DeadLetters { limit } => {
            if !config.dead_letter_path.exists() {
                println!("No dead letters ({} missing)", config.dead_letter_path.display());
                return Ok(());
            }
            let envelopes = JsonlDeadLetterSink::read_all(&config.dead_letter_path)?;
            let skip = envelopes.len().saturating_sub(limit);
            println!("{} dead letters:", envelopes.len());
            for env in envelopes.iter().skip(skip) {
                println!(
                    "  ts={} source={} kind={:?} retryable={} device={} size={} bytes: {}",
                    env.failed_at_ns,
                    env.source,
                    env.kind,
                    env.retryable,
                    env.device_id.as_deref().unwrap_or("-"),
                    env.raw_payload.len(),
                    env.cause
                );
            }
        }
    }
    Ok(())
}

/// Query commands never create a database.
fn open_for_query(path: &Path) -> Result<SqliteStore> {
    if !path.exists() {
        anyhow::bail!("Database {} not found", path.display());
    }
    SqliteStore::open_read_only(path)
        .with_context(|| format!("Failed to open database {}", path.display()))
}
