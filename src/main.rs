// =============================================================================
// Meridian Spot Engine — Main Entry Point
// =============================================================================
//
// The engine ships fail-closed: dry_run mode with a read-only adapter. Live
// trading requires mode=live AND the --yes-i-know flag AND API credentials
// in the environment.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod audit;
mod coinbase;
mod config;
mod execution;
mod metrics;
#[cfg(test)]
mod mock_exchange;
mod orchestrator;
mod orders;
mod portfolio;
mod regime;
mod risk;
mod sentinel;
mod signals;
mod sim;
mod store;
mod strategies;
mod types;
mod universe;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertPipeline;
use crate::coinbase::client::CoinbaseClient;
use crate::config::Config;
use crate::execution::ExecutionEngine;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::orders::OrderStateMachine;
use crate::store::StateStore;
use crate::strategies::{build_strategies, default_entries};
use crate::types::ExecutionMode;

#[derive(Debug, Parser)]
#[command(name = "meridian-bot", about = "Autonomous spot trading engine for Coinbase Advanced Trade")]
struct Cli {
    /// Run continuously until SIGINT/SIGTERM.
    #[arg(long = "loop", conflicts_with = "once")]
    run_loop: bool,

    /// Run exactly one cycle and exit.
    #[arg(long)]
    once: bool,

    /// Override the configured mode to paper.
    #[arg(long, conflicts_with_all = ["live", "dry_run"])]
    paper: bool,

    /// Override the configured mode to live. Requires --yes-i-know.
    #[arg(long, conflicts_with_all = ["paper", "dry_run"])]
    live: bool,

    /// Override the configured mode to dry-run.
    #[arg(long = "dry-run", conflicts_with_all = ["paper", "live"])]
    dry_run: bool,

    /// Explicit confirmation that live trading with real funds is intended.
    #[arg(long = "yes-i-know")]
    yes_i_know: bool,

    /// Directory holding app/policy/universe/signals/strategies YAML files.
    #[arg(long = "config-dir", default_value = "config")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Meridian Spot Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration + sanity gate ───────────────────────────────────
    let mut cfg = Config::load_dir(&cli.config_dir)
        .with_context(|| format!("failed to load config from {}", cli.config_dir.display()))?;

    if cli.paper {
        cfg.app.mode = ExecutionMode::Paper;
    } else if cli.dry_run {
        cfg.app.mode = ExecutionMode::DryRun;
    } else if cli.live {
        cfg.app.mode = ExecutionMode::Live;
    }

    cfg.validate().context("config sanity gate failed")?;

    // ── 2. Credentials & live-mode opt-in ────────────────────────────────
    let api_key = std::env::var("CB_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("CB_API_SECRET").unwrap_or_default();

    if cfg.app.mode == ExecutionMode::Live {
        if !cli.yes_i_know {
            bail!("live mode trades real funds; re-run with --live --yes-i-know");
        }
        if api_key.is_empty() || api_secret.is_empty() {
            bail!("live mode requires CB_API_KEY and CB_API_SECRET in the environment");
        }
    }

    info!(mode = %cfg.app.mode, config_hash = %cfg.hash(), "engine configuration");

    // ── 3. Single-instance lock ──────────────────────────────────────────
    let data_dir = PathBuf::from(&cfg.app.data_dir);
    let _pid_lock = sentinel::PidLock::acquire(&data_dir, &cfg.app.name)?;

    // ── 4. Core components ───────────────────────────────────────────────
    let read_only = cfg.app.mode != ExecutionMode::Live;
    let exchange = Arc::new(CoinbaseClient::new(api_key, api_secret, read_only));

    let store = Arc::new(StateStore::load(data_dir.join("state.json"))?);
    let flusher = store.spawn_flusher(Duration::from_secs(cfg.app.persist_interval_seconds));

    let alerts = Arc::new(AlertPipeline::new(cfg.policy.alerts.clone()));
    let osm = Arc::new(OrderStateMachine::new(Duration::from_secs(
        cfg.policy.execution.ghost_ttl_seconds,
    )));

    let exec = Arc::new(ExecutionEngine::new(
        exchange.clone(),
        osm.clone(),
        store.clone(),
        alerts.clone(),
        cfg.policy.execution.clone(),
        cfg.policy.purge_execution.clone(),
        cfg.policy.risk.clone(),
        cfg.app.mode,
    ));

    // The kill switch must be noticed within seconds, not at the next cycle:
    // a dedicated watcher polls the sentinel file, halts trading, and cancels
    // every open order as soon as it appears.
    {
        let store = store.clone();
        let alerts = alerts.clone();
        let exec = exec.clone();
        let dir = data_dir.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut engaged = false;
            loop {
                interval.tick().await;
                let present = sentinel::kill_switch_present(&dir);
                if present && !engaged {
                    engaged = true;
                    store.update(|s| s.kill_switch_active = true);
                    alerts.notify(
                        crate::alerts::AlertSeverity::Critical,
                        "kill_switch_activated",
                        "kill switch detected: trading halted, canceling open orders",
                        serde_json::Value::Null,
                    );
                    if let Err(e) = exec.cancel_all_active().await {
                        warn!(error = %e, "kill-switch cancel-all failed");
                    }
                    if let Err(e) = store.flush() {
                        warn!(error = %e, "kill-switch state flush failed");
                    }
                } else if !present && engaged {
                    engaged = false;
                    store.update(|s| s.kill_switch_active = false);
                    info!("kill switch file removed — trading re-enabled");
                }
            }
        });
    }

    if cfg.strategies.strategies.is_empty() {
        info!("no strategies configured, using the default set");
        cfg.strategies.strategies = default_entries();
    }
    let strategies = build_strategies(&cfg.strategies);
    if cfg.strategies.advisor.enabled {
        warn!("advisor.enabled is set but no advisor transport is built in; ignoring");
    }

    // ── 5. Metrics server ────────────────────────────────────────────────
    let metrics = Metrics::new()?;
    if cfg.app.metrics.enabled {
        let server = metrics.clone();
        let port = cfg.app.metrics.port;
        let range = cfg.app.metrics.port_retry_range;
        tokio::spawn(async move {
            if let Err(e) = server.serve(port, range).await {
                warn!(error = %e, "metrics server exited");
            }
        });
    }

    // ── 6. Shutdown signal handling ──────────────────────────────────────
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            warn!("shutdown signal received — stopping after the current cycle");
            stop.store(true, Ordering::Relaxed);
        });
    }

    // ── 7. Run ───────────────────────────────────────────────────────────
    let mut orchestrator = Orchestrator::new(
        cfg,
        exchange,
        store.clone(),
        alerts,
        osm,
        exec,
        strategies,
        Vec::new(),
        metrics,
        stop,
    );

    if cli.run_loop {
        orchestrator.run_loop().await?;
    } else {
        if !cli.once {
            info!("neither --loop nor --once given; running a single cycle");
        }
        let outcome = orchestrator.run_once().await?;
        info!(outcome = %outcome, "single cycle finished");
    }

    flusher.abort();
    store.flush().context("final state flush failed")?;
    info!("Meridian Spot Engine shut down complete.");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
