//! Karaoke sync harness (kara-sync) - Main entry point
//!
//! Drives the sync engine against the simulated media backend: loads a track,
//! plays it with an optional loop region and rate, and prints every engine
//! event as a JSON line until the run time elapses or the process is
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kara_common::config::{resolve_config_path, CONFIG_ENV_VAR};
use kara_sync::media::sim::{SimBackend, SimMedia};
use kara_sync::{Location, SyncEngine, TomlConfig};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for kara-sync
#[derive(Parser, Debug)]
#[command(name = "kara-sync")]
#[command(about = "Karaoke transport and sync harness over the simulated backend")]
#[command(version)]
struct Args {
    /// Configuration file (overrides KARA_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instrumental (primary) location
    #[arg(long, default_value = "sim://instrumental.ogg")]
    primary: String,

    /// Vocal (follower) location; omit for a primary-only track
    #[arg(long)]
    follower: Option<String>,

    /// Simulated track length in seconds
    #[arg(long, default_value = "180.0")]
    track_length: f64,

    /// Make the follower fail to load
    #[arg(long)]
    fail_follower: bool,

    /// Loop region start in seconds
    #[arg(long, requires = "loop_end")]
    loop_start: Option<f64>,

    /// Loop region end in seconds
    #[arg(long, requires = "loop_start")]
    loop_end: Option<f64>,

    /// Start position in seconds
    #[arg(long)]
    seek: Option<f64>,

    /// Playback rate
    #[arg(long, default_value = "1.0")]
    rate: f64,

    /// How long to run before stopping, in seconds
    #[arg(long, default_value = "10")]
    run_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref(), CONFIG_ENV_VAR)
        .context("Failed to resolve configuration path")?;
    let config = TomlConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing; RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("kara_sync={0},kara_common={0}", config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting kara-sync harness");
    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }

    let backend = SimBackend::new();
    backend.register(args.primary.clone(), SimMedia::new(args.track_length));
    if let Some(follower) = &args.follower {
        let mut media = SimMedia::new(args.track_length);
        if args.fail_follower {
            media = media.failing_open("simulated follower failure");
        }
        backend.register(follower.clone(), media);
    }

    let engine = SyncEngine::new(Arc::new(backend.clone()), config).context("Failed to create sync engine")?;
    let mut events = engine.subscribe_events();

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Could not serialize {}: {}", event.name(), e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Event printer lagged, {} events skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let summary = engine
        .load_track(args.primary.as_str(), args.follower.clone().map(Location::from))
        .await
        .context("Failed to load track")?;
    info!(
        "Loaded track {} ({:.1}s, follower: {})",
        summary.track_id, summary.duration, summary.has_follower
    );

    if args.rate != 1.0 {
        engine.set_rate(args.rate).await;
    }
    if let Some(position) = args.seek {
        engine.seek(position).await;
    }
    if let (Some(start), Some(end)) = (args.loop_start, args.loop_end) {
        if !engine.set_loop(start, end).await {
            warn!("Loop region [{}, {}] rejected", start, end);
        }
    }

    engine.play().await.context("Failed to start playback")?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.run_secs)) => {
            info!("Run time elapsed");
        },
        _ = shutdown_signal() => {},
    }

    info!("Stopping at {:.3}s", engine.current_time().await);
    engine.stop().await;
    info!(
        "Live handles after stop: {} resources, {} connections",
        backend.live_resources(),
        backend.live_connections()
    );

    drop(engine);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("Event printer did not finish");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
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
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
