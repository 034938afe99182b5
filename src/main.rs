//! Feeder entry point
//!
//! Loads configuration, wires the oracle to its collaborators and runs the
//! tick loop plus the status server until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use feeder::config::AppConfig;
use feeder::history::PriceHistory;
use feeder::oracle::Oracle;
use feeder::publisher::TopicClient;
use feeder::server::{self, ServerState};
use feeder::telemetry::{MemorySink, NoopSink, Telemetry};

#[derive(Parser, Debug)]
#[command(name = "feeder")]
#[command(about = "Aggregates venue prices and publishes signed rate votes to a ledger topic")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    info!(
        pairs = config.currency_pairs.len(),
        vote_period = %config.vote_period,
        voter = config.enable_voter,
        "starting feeder"
    );

    let telemetry: Arc<dyn Telemetry> = if config.telemetry.enabled {
        Arc::new(MemorySink::new(config.telemetry.labels()))
    } else {
        Arc::new(NoopSink)
    };

    // Retention must outlive the longest TWAP window; double it for slack.
    let retention = config
        .derivative_periods()?
        .values()
        .max()
        .map(|period| *period * 2)
        .unwrap_or(Duration::from_secs(3600));
    let history = Arc::new(PriceHistory::open(
        std::path::Path::new(&config.history_db),
        retention,
    )?);

    let publisher = Arc::new(TopicClient::new(&config.account)?);

    let cancel = CancellationToken::new();
    let oracle = Oracle::new(
        &config,
        publisher,
        history,
        telemetry.clone(),
        cancel.clone(),
    )?;

    let server_handle = if config.enable_server {
        let state = ServerState {
            book: oracle.price_book(),
            telemetry: telemetry.clone(),
        };
        let server_cfg = config.server.clone();
        let server_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = server::serve(&server_cfg, state, server_cancel).await {
                tracing::error!(%err, "status server exited");
            }
        }))
    } else {
        None
    };

    let oracle_handle = tokio::spawn(oracle.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("received ctrl-c, shutting down");
    cancel.cancel();

    // Let the in-flight tick drain before exiting.
    let _ = oracle_handle.await;
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }

    info!("shutdown complete");
    Ok(())
}
