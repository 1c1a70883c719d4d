// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! drone-sim - Drone fleet telemetry simulator
//!
//! Streams generated device state to an ingestion endpoint.
//!
//! # Usage
//!
//! ```bash
//! # 1000 devices against a local ingestion service, until Ctrl+C
//! drone-sim --endpoint 127.0.0.1:7400
//!
//! # 50 devices for 2 minutes, keyframe every 20 records
//! NUMBER_OF_DEVICES=50 SECONDS_TO_RUN=120 GENERATE_KEYFRAME_GAP=20 drone-sim
//!
//! # From a configuration file
//! drone-sim gen-config -o fleet.toml
//! drone-sim --config fleet.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drone_telemetry::{
    CancellationToken, ConnectionPool, Fleet, FleetConfig, FleetReport, TcpTransport,
    TelemetryGenerator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Drone fleet telemetry simulator
#[derive(Parser, Debug)]
#[command(name = "drone-sim")]
#[command(about = "Drone fleet telemetry simulator")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "DRONE_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Ingestion endpoint (host:port)
    #[arg(short, long, env = "DRONE_SIM_ENDPOINT")]
    endpoint: Option<String>,

    /// Number of simulated devices
    #[arg(short = 'n', long, env = "NUMBER_OF_DEVICES")]
    devices: Option<usize>,

    /// Run duration in seconds (0 = until Ctrl+C)
    #[arg(short, long, env = "SECONDS_TO_RUN")]
    seconds: Option<u64>,

    /// Every Nth record per device is a keyframe
    #[arg(short, long, env = "GENERATE_KEYFRAME_GAP")]
    key_frame_gap: Option<u64>,

    /// Pause between records of one device (milliseconds)
    #[arg(long, env = "MESSAGE_DELAY_MS")]
    delay_ms: Option<u64>,

    /// Delay before each device starts (milliseconds)
    #[arg(long, env = "START_DELAY_MS")]
    start_delay_ms: Option<u64>,

    /// Connections in the shared pool
    #[arg(short, long, env = "POOL_SIZE")]
    pool_size: Option<usize>,

    /// Stop each device after this many records
    #[arg(short, long)]
    max_messages: Option<u64>,

    /// Random seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Progress reporting interval (seconds, 0 to disable)
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
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "fleet.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
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

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;

    println!("Drone Fleet Simulator v{}", env!("CARGO_PKG_VERSION"));
    println!("================================");
    println!("  Endpoint:     {}", config.endpoint);
    println!("  Devices:      {}", config.devices);
    println!("  Pool size:    {}", config.pool_size);
    println!("  Keyframe gap: {}", config.key_frame_gap);
    match config.run_duration() {
        Some(d) => println!("  Duration:     {}s", d.as_secs()),
        None => println!("  Duration:     until Ctrl+C"),
    }
    println!();

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down, draining buffered records...");
            signal_token.cancel();
        }
    });

    let endpoint = config.endpoint.clone();
    let max_frame_size = config.max_frame_size;
    let pool = ConnectionPool::connect(config.pool_size, |_| {
        TcpTransport::connect(endpoint.clone(), max_frame_size)
    })
    .await
    .with_context(|| format!("Failed to open {} connections to {}", config.pool_size, endpoint))?;

    let generator = match config.seed {
        Some(seed) => TelemetryGenerator::with_seed(seed),
        None => TelemetryGenerator::new(),
    };

    let report = Fleet::new(config.devices, config.pipeline_config(), pool)
        .with_run_duration(config.run_duration())
        .with_report_interval(config.report_interval())
        .with_generator(Arc::new(generator))
        .run(token)
        .await?;

    print_report(&report);
    if let Some(failure) = report.failure {
        anyhow::bail!("Run aborted: {}", failure);
    }
    Ok(())
}

/// Defaults, then file, then environment and command line.
fn build_config(args: &Args) -> Result<FleetConfig> {
    let mut config = match &args.config {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => FleetConfig::default(),
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(devices) = args.devices {
        config.devices = devices;
    }
    if let Some(seconds) = args.seconds {
        config.run_seconds = seconds;
    }
    if let Some(gap) = args.key_frame_gap {
        config.key_frame_gap = gap;
    }
    if let Some(delay) = args.delay_ms {
        config.message_delay_ms = delay;
    }
    if let Some(delay) = args.start_delay_ms {
        config.start_delay_ms = delay;
    }
    if let Some(size) = args.pool_size {
        config.pool_size = size;
    }
    if args.max_messages.is_some() {
        config.max_messages = args.max_messages;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(interval) = args.stats_interval {
        config.stats_interval_secs = interval;
    }

    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: PathBuf) -> Result<()> {
    let config = FleetConfig::builder()
        .devices(100)
        .run_seconds(300)
        .key_frame_gap(100)
        .pool_size(20)
        .build();

    std::fs::write(&output, config.to_toml()?)?;
    println!("Generated configuration: {}", output.display());
    Ok(())
}

fn cmd_validate(path: PathBuf) -> Result<()> {
    match FleetConfig::from_file(&path) {
        Ok(config) => {
            println!("Configuration is valid: {}", path.display());
            println!("  Devices:   {}", config.devices);
            println!("  Endpoint:  {}", config.endpoint);
            println!("  Pool size: {}", config.pool_size);
            Ok(())
        }
        Err(e) => {
            anyhow::bail!("Invalid configuration {}: {}", path.display(), e);
        }
    }
}

fn print_report(report: &FleetReport) {
    let t = &report.totals;
    println!();
    println!("--- Fleet Statistics ---");
    println!("  Devices:     {}", report.devices);
    println!("  Elapsed:     {:.1}s", report.elapsed.as_secs_f64());
    println!("  Generated:   {}", t.generated);
    println!("  Keyframes:   {}", t.key_frames);
    println!("  Sent:        {}", t.sent);
    println!("  Failed:      {}", t.failed);
    println!("  Dropped:     {}", t.dropped);
    println!("  Throughput:  {:.1} msg/s", report.messages_per_second());
}
