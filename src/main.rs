// =============================================================================
// Stride — paper→live promotion controller for perpetual futures
// =============================================================================
//
// Runs a shadow strategy across the active universe and promotes exactly one
// signal into a real bracketed position when a symbol's paper loss streak
// arms the trigger. Live trading stays off until `live_enabled` is set AND
// credentials are present in the environment.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod gateway;
mod indicators;
mod live;
mod logs;
mod market_data;
mod orchestrator;
mod paper;
mod signal;
mod types;
mod universe;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::gateway::ExchangeGateway;
use crate::live::LiveEngine;
use crate::logs::CsvLog;
use crate::orchestrator::Orchestrator;
use crate::paper::PaperEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Stride — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".into());
    let mut config = Config::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg
    });

    // SAFETY: live trading needs both the flag and credentials.
    if config.live_enabled && (config.api_key.is_empty() || config.api_secret.is_empty()) {
        warn!("live_enabled set without credentials — forcing paper-only mode");
        config.live_enabled = false;
    }
    config.validate()?;

    info!(
        symbol_mode = %config.symbol_mode,
        quote = %config.quote,
        paper_enabled = config.paper_enabled,
        live_enabled = config.live_enabled,
        loss_streak_to_arm = config.loss_streak_to_arm,
        "engine configuration"
    );

    let config = Arc::new(config);

    // ── 2. Gateway ───────────────────────────────────────────────────────
    let gateway = Arc::new(ExchangeGateway::new(
        config.rest_base.clone(),
        config.api_key.clone(),
        config.api_secret.clone(),
    ));
    if let Err(e) = gateway.sync_time().await {
        warn!(error = %e, "server time sync failed — signing with local clock");
    }

    // ── 3. Engines ───────────────────────────────────────────────────────
    let paper = Arc::new(PaperEngine::new(
        config.clone(),
        CsvLog::open(&config.paper_log_path)?,
    ));
    let live = Arc::new(LiveEngine::new(
        gateway.clone(),
        config.clone(),
        CsvLog::open(&config.live_log_path)?,
    ));

    // ── 4. Orchestrator + shutdown wiring ────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        gateway.clone(),
        paper.clone(),
        live.clone(),
    ));

    let runner = tokio::spawn(orchestrator.run(stop_rx));

    wait_for_shutdown_signal().await;
    warn!("shutdown signal received — stopping gracefully");
    let _ = stop_tx.send(true);

    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "orchestrator exited with error"),
        Err(e) => error!(error = %e, "orchestrator task panicked"),
    }

    info!("Stride shut down complete.");
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
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
