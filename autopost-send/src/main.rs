//! autopost-send - Background daemon for scheduled publishing
//!
//! Runs the scheduler, the dispatcher worker pool and the analytics sync
//! against the shared database until it receives SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use libautopost::logging::{LogFormat, LoggingConfig};
use libautopost::{AutopostError, Config, PublishingService};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "autopost-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing")]
#[command(long_about = "\
autopost-send - Background daemon for scheduled publishing

DESCRIPTION:
    autopost-send is a long-running daemon that publishes scheduled posts
    at their due time.

    The scheduler admits due posts exactly once and hands them to a pool
    of dispatch workers. Workers publish every target through its platform
    adapter, refreshing expired tokens and retrying transient failures
    with exponential backoff. A third loop collects account and post
    metrics on a fixed interval.

USAGE:
    # Run in foreground (logs to stderr)
    autopost-send

    # Structured logs for a log collector
    autopost-send --log-format json

    # Enable verbose logging
    autopost-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight posts finish first)

CONFIGURATION:
    Configuration file: ~/.config/autopost/config.toml
    Database location: ~/.local/share/autopost/autopost.db

    [scheduler]
    tick_interval_secs = 30   # seconds between scheduler ticks
    stale_claim_secs = 3600   # reclaim attempts abandoned by a crash

    [dispatcher]
    workers = 4               # concurrent platform calls
    max_attempts = 5          # transient failures before giving up
    base_delay_secs = 2       # first retry delay, doubled each time
    publish_timeout_secs = 900  # deadline for one publish, uploads included

    [analytics]
    enabled = true
    interval_secs = 3600

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log format: text, json or pretty
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run once and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Admit and dispatch due posts once, then exit")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env(cli.verbose);
    if let Some(format) = &cli.log_format {
        match format.parse::<LogFormat>() {
            Ok(format) => logging.format = format,
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(2);
            }
        }
    }
    logging.init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "autopost-send failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<AutopostError>() {
        Some(AutopostError::Config(_)) => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Cannot load {}", path.display()))?,
        None => Config::load().context("Cannot load configuration")?,
    };
    let service = PublishingService::from_config(config)
        .await
        .context("Cannot start publishing service")?;

    info!("autopost-send daemon starting");

    if cli.once {
        run_once(&service).await?;
        info!("autopost-send: processed due posts once, exiting");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx)?;

    run_daemon(&service, shutdown_rx).await;

    info!("autopost-send daemon stopped");
    Ok(())
}

/// Run the three loops until shutdown
async fn run_daemon(service: &PublishingService, shutdown: watch::Receiver<bool>) {
    let config = service.config();
    let (queue_tx, queue_rx) = mpsc::channel(config.dispatcher.queue_capacity.max(1));

    let scheduler = service.scheduler();
    let dispatcher = Arc::new(service.dispatcher());
    let analytics = service.analytics();

    info!(
        workers = config.dispatcher.workers,
        tick_interval_secs = config.scheduler.tick_interval_secs,
        platforms = ?service.registry().platforms(),
        "Loops starting"
    );

    let analytics_loop = async {
        if config.analytics.enabled {
            analytics
                .run(
                    Duration::from_secs(config.analytics.interval_secs),
                    shutdown.clone(),
                )
                .await;
        } else {
            info!("Analytics sync disabled");
        }
    };

    tokio::join!(
        scheduler.run(queue_tx, shutdown.clone()),
        dispatcher.run(queue_rx, shutdown.clone()),
        analytics_loop,
    );
}

/// One scheduler tick, dispatch of everything it admitted, one metrics cycle
async fn run_once(service: &PublishingService) -> anyhow::Result<()> {
    let report = service.scheduler().tick().await?;
    if report.is_empty() {
        info!("No posts due");
    }

    let dispatcher = service.dispatcher();
    for post_id in report.record_ids() {
        match dispatcher.process_record(post_id).await {
            Ok(outcome) => info!(
                post_id = %post_id,
                posted = outcome.posted,
                deferred = outcome.deferred,
                failed = outcome.failed,
                state = ?outcome.state,
                "Post processed"
            ),
            Err(e) => error!(post_id = %post_id, error = %e, "Failed to process post"),
        }
    }

    if service.config().analytics.enabled {
        let sync = service.analytics().run_cycle().await?;
        info!(
            snapshots = sync.snapshots,
            failures = sync.failures,
            "Analytics cycle finished"
        );
    }
    Ok(())
}

/// Flip `shutdown` on SIGINT or SIGTERM
#[cfg(unix)]
fn spawn_signal_listener(shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;
    let handle = signals.handle();

    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "Received shutdown signal, stopping gracefully...");
            if shutdown.send(true).is_err() {
                warn!("All loops already stopped");
            }
        }
        handle.close();
    });

    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listener(shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            if shutdown.send(true).is_err() {
                warn!("All loops already stopped");
            }
        }
    });
    Ok(())
}
