// =============================================================================
// Orchestrator — tick fan-in, signal routing, and the supervisor loops
// =============================================================================
//
// Owns the shared per-symbol state and runs the long-lived tasks:
//
//   universe_loop      — recompute the active symbol set periodically
//   spread_loop        — round-robin bookTicker polls into the spread cache
//   ws_loop            — trade stream with reconnect/backoff
//   tick_loop          — serialized tick handling and signal routing
//   heartbeat_loop     — one status line on a jittered cadence
//   ws_watchdog_loop   — stale-stream detection, one reconnect per episode
//   paper_timeout_loop — deadline sweep for paper positions under tick silence
//
// Tick handling for a symbol is serialized by construction: one mpsc consumer.
// The frozen→live promotion runs inline on the tick path, so at most one
// open-and-watch flow exists at a time.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, sleep, Duration};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::gateway::ExchangeGateway;
use crate::indicators::{calculate_atr_pct, impulse_return_pct};
use crate::live::{LiveEngine, LiveError, SharedPrices};
use crate::market_data::{run_trade_stream, BarSeries, StreamExit, TickBuffer};
use crate::paper::PaperEngine;
use crate::signal::{self, SignalInputs};
use crate::types::{now_ms, now_secs, CloseReason, TradeTick};
use crate::universe::UniverseBuilder;

/// Delay after a stream error before redialing.
const WS_ERROR_BACKOFF_SECS: u64 = 3;
/// Shorter delay after a watchdog-initiated reconnect.
const WS_STALE_BACKOFF_SECS: u64 = 1;
/// Pause between per-symbol bookTicker polls.
const SPREAD_POLL_GAP_MS: u64 = 500;
/// Cadence of the paper-timeout sweeper.
const PAPER_SWEEP_SECS: u64 = 2;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Mutable state shared between the supervisor loops and the tick path.
pub struct EngineState {
    pub active_symbols: RwLock<Vec<String>>,
    pub bars: RwLock<HashMap<String, BarSeries>>,
    pub ticks: RwLock<HashMap<String, TickBuffer>>,
    /// Latest bookTicker spread percent per symbol.
    pub spread_cache: RwLock<HashMap<String, f64>>,
    pub last_prices: SharedPrices,
    pub last_ws_msg_ms: Arc<AtomicI64>,
    pub last_tick_ms: AtomicI64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            active_symbols: RwLock::new(Vec::new()),
            bars: RwLock::new(HashMap::new()),
            ticks: RwLock::new(HashMap::new()),
            spread_cache: RwLock::new(HashMap::new()),
            last_prices: Arc::new(RwLock::new(HashMap::new())),
            last_ws_msg_ms: Arc::new(AtomicI64::new(now_ms())),
            last_tick_ms: AtomicI64::new(now_ms()),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    cfg: Arc<Config>,
    gateway: Arc<ExchangeGateway>,
    paper: Arc<PaperEngine>,
    live: Arc<LiveEngine>,
    universe: UniverseBuilder,
    state: Arc<EngineState>,
    ws_reconnect: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(
        cfg: Arc<Config>,
        gateway: Arc<ExchangeGateway>,
        paper: Arc<PaperEngine>,
        live: Arc<LiveEngine>,
    ) -> Self {
        let universe = UniverseBuilder::new(gateway.clone(), cfg.clone());
        Self {
            cfg,
            gateway,
            paper,
            live,
            universe,
            state: Arc::new(EngineState::new()),
            ws_reconnect: Arc::new(Notify::new()),
        }
    }

    /// Run until the stop signal flips. Spawns every supervisor task, then
    /// waits for the tick consumer to finish so a live force-exit can
    /// complete before returning.
    pub async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) -> Result<()> {
        // First universe build before anything subscribes.
        match self.universe.build_once().await {
            Ok(symbols) => self.apply_universe(symbols),
            Err(e) => warn!(error = %e, "initial universe build failed — starting empty"),
        }

        let (tick_tx, tick_rx) = mpsc::channel::<TradeTick>(4096);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().universe_loop(stop.clone())));
        tasks.push(tokio::spawn(self.clone().spread_loop(stop.clone())));
        tasks.push(tokio::spawn(self.clone().ws_loop(tick_tx, stop.clone())));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop(stop.clone())));
        tasks.push(tokio::spawn(self.clone().ws_watchdog_loop(stop.clone())));
        tasks.push(tokio::spawn(self.clone().paper_timeout_loop(stop.clone())));

        let consumer = tokio::spawn(self.clone().tick_loop(tick_rx, stop.clone()));
        info!("orchestrator running");

        // The consumer drains the channel and drives any live force-exit on
        // shutdown; wait for it, then let the other loops wind down.
        if let Err(e) = consumer.await {
            error!(error = %e, "tick consumer panicked");
        }
        for t in tasks {
            t.abort();
        }
        info!("orchestrator stopped");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Universe
    // -------------------------------------------------------------------------

    /// Commit a new active set: fresh per-symbol state and zero streaks for
    /// joiners, and a stream resubscribe when membership changed. Departing
    /// symbols keep any open paper position until its own close path fires.
    fn apply_universe(&self, symbols: Vec<String>) {
        let changed = {
            let current = self.state.active_symbols.read();
            *current != symbols
        };
        if !changed {
            return;
        }

        {
            let mut bars = self.state.bars.write();
            let mut ticks = self.state.ticks.write();
            for sym in &symbols {
                bars.entry(sym.clone()).or_insert_with(|| {
                    BarSeries::new(self.cfg.tf_sec, self.cfg.bar_capacity())
                });
                ticks
                    .entry(sym.clone())
                    .or_insert_with(|| TickBuffer::new(self.cfg.impulse_lookback_sec));
            }
        }
        self.paper.ensure_symbols(&symbols);

        info!(count = symbols.len(), symbols = ?symbols, "active universe updated");
        *self.state.active_symbols.write() = symbols;
        // Subscriptions follow the active set.
        self.ws_reconnect.notify_one();
    }

    async fn universe_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.cfg.refresh_universe_sec.max(1)));
        ticker.tick().await; // initial build already done in run()

        loop {
            tokio::select! {
                c = stop.changed() => if c.is_err() || *stop.borrow() { return; },
                _ = ticker.tick() => {}
            }
            match self.universe.build_once().await {
                Ok(symbols) => self.apply_universe(symbols),
                Err(e) => warn!(error = %e, "universe refresh failed — keeping current set"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Spread cache
    // -------------------------------------------------------------------------

    async fn spread_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            let symbols = self.state.active_symbols.read().clone();
            if symbols.is_empty() {
                tokio::select! {
                    c = stop.changed() => if c.is_err() || *stop.borrow() { return; },
                    _ = sleep(Duration::from_secs(2)) => {}
                }
                continue;
            }

            for symbol in symbols {
                if *stop.borrow() {
                    return;
                }
                match self.gateway.book_ticker(&symbol).await {
                    Ok(book) => {
                        if let Some(spread) = book.spread_pct() {
                            self.state.spread_cache.write().insert(symbol.clone(), spread);
                        }
                    }
                    Err(e) => warn!(symbol = %symbol, error = %e, "bookTicker poll failed"),
                }
                tokio::select! {
                    c = stop.changed() => if c.is_err() || *stop.borrow() { return; },
                    _ = sleep(Duration::from_millis(SPREAD_POLL_GAP_MS)) => {}
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Trade stream
    // -------------------------------------------------------------------------

    async fn ws_loop(
        self: Arc<Self>,
        tick_tx: mpsc::Sender<TradeTick>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            if *stop.borrow() {
                return;
            }

            let symbols = self.state.active_symbols.read().clone();
            if symbols.is_empty() {
                sleep(Duration::from_secs(1)).await;
                continue;
            }

            let result = run_trade_stream(
                &self.cfg.ws_base,
                self.cfg.ws_mode,
                &symbols,
                &tick_tx,
                &self.state.last_ws_msg_ms,
                &self.ws_reconnect,
                &mut stop,
            )
            .await;

            match result {
                Ok(StreamExit::Stopped) => return,
                Ok(StreamExit::Stale) => {
                    sleep(Duration::from_secs(WS_STALE_BACKOFF_SECS)).await;
                }
                Ok(StreamExit::Ended) => {
                    warn!("WS ended — reconnecting");
                    sleep(Duration::from_secs(WS_ERROR_BACKOFF_SECS)).await;
                }
                Err(e) => {
                    error!(error = %e, "WS error — reconnecting");
                    sleep(Duration::from_secs(WS_ERROR_BACKOFF_SECS)).await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tick consumption and routing
    // -------------------------------------------------------------------------

    async fn tick_loop(
        self: Arc<Self>,
        mut tick_rx: mpsc::Receiver<TradeTick>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                tick = tick_rx.recv() => {
                    match tick {
                        Some(tick) => self.handle_trade_tick(tick, &mut stop).await,
                        None => break,
                    }
                }
            }
        }

        // Shutdown with a live position still on: force it flat.
        if self.live.has_position() {
            warn!("shutdown with live position — forcing exit");
            let mut stop_rx = stop.clone();
            match self
                .live
                .watch_until_close(&self.state.last_prices, &mut stop_rx)
                .await
            {
                Ok(Some(outcome)) => {
                    info!(reason = %outcome.reason, "live position force-closed on shutdown");
                    self.paper.reset_all_streaks();
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "force exit failed — position may remain open"),
            }
        }
    }

    /// One trade: indicators, paper close checks, signal, and routing.
    async fn handle_trade_tick(&self, tick: TradeTick, stop: &mut watch::Receiver<bool>) {
        let TradeTick { symbol, price, ts_ms } = tick;

        if !self.state.active_symbols.read().contains(&symbol) {
            return;
        }

        self.state.last_tick_ms.store(now_ms(), Ordering::Relaxed);
        self.state
            .last_prices
            .write()
            .insert(symbol.clone(), price);

        // 1. Indicator updates.
        let atr_pct = {
            let mut bars = self.state.bars.write();
            let series = bars.entry(symbol.clone()).or_insert_with(|| {
                BarSeries::new(self.cfg.tf_sec, self.cfg.bar_capacity())
            });
            series.on_trade(ts_ms, price);
            calculate_atr_pct(
                &series.recent_closed(self.cfg.atr_period + 1),
                self.cfg.atr_period,
            )
        };
        let impulse_pct = {
            let mut ticks = self.state.ticks.write();
            let buf = ticks
                .entry(symbol.clone())
                .or_insert_with(|| TickBuffer::new(self.cfg.impulse_lookback_sec));
            buf.push(ts_ms, price);
            impulse_return_pct(buf.samples(), ts_ms, self.cfg.impulse_lookback_sec)
        };

        // 2. Paper closes first, so an exit and a re-entry never share a tick.
        let now = now_secs();
        let _ = self.paper.close_on_price(&symbol, price, now);

        // 3. Signal.
        let spread_pct = self.state.spread_cache.read().get(&symbol).copied();
        let inputs = SignalInputs {
            impulse_pct,
            atr_pct,
            spread_pct,
        };
        let Some(side) = signal::evaluate(&symbol, &inputs, &self.cfg) else {
            return;
        };

        // 4. Normal mode: route into paper.
        let freeze = self.paper.freeze_state();
        if !freeze.entries_frozen {
            if self.paper.can_open(&symbol, now) {
                let _ = self.paper.open(&symbol, side, price, now);
            }
            return;
        }

        // 5. Frozen: only the trigger symbol may promote, and only once its
        //    own paper position is gone.
        let Some(trigger) = freeze.trigger_symbol else {
            return;
        };
        if symbol != trigger || self.paper.has_position(&trigger) {
            return;
        }

        // Deviation guard before any live (or reset) action.
        if self.cfg.max_deviation_pct > 0.0 {
            match self.gateway.book_ticker(&symbol).await {
                Ok(book) => {
                    let mid = book.mid();
                    if mid > 0.0 {
                        let dev = ((price - mid) / mid * 100.0).abs();
                        if dev > self.cfg.max_deviation_pct {
                            warn!(
                                symbol = %symbol,
                                deviation_pct = format!("{dev:.3}"),
                                "trigger signal rejected by deviation guard"
                            );
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "deviation check failed — skipping trigger");
                    return;
                }
            }
        }

        if !self.cfg.live_enabled {
            info!(symbol = %symbol, "live disabled — trigger consumes the freeze");
            self.paper.reset_all_streaks();
            return;
        }

        info!(symbol = %symbol, side = %side, price, "TRIGGER — promoting to live");
        match self.live.open_live(&symbol, side, price).await {
            Ok(_) => {}
            Err(e) => {
                // Stay frozen; the next trigger signal may retry.
                match e {
                    LiveError::Deviation { .. } => warn!(symbol = %symbol, error = %e, "live open refused"),
                    _ => error!(symbol = %symbol, error = %e, "live open failed — staying frozen"),
                }
                return;
            }
        }

        match self
            .live
            .watch_until_close(&self.state.last_prices, stop)
            .await
        {
            Ok(Some(outcome)) => {
                info!(
                    symbol = %outcome.symbol,
                    outcome = outcome.outcome,
                    reason = %outcome.reason,
                    net_pnl = format!("{:.4}", outcome.net_pnl),
                    "live trade settled"
                );
                self.paper.reset_all_streaks();
            }
            Ok(None) => {
                // Nothing to watch means the open never stuck; reset anyway.
                self.paper.reset_all_streaks();
            }
            Err(e) => {
                // A failed confirmed close keeps the freeze so no second live
                // attempt can start; operator intervention required.
                error!(symbol = %symbol, error = %e, "live close failed — staying frozen");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Heartbeat
    // -------------------------------------------------------------------------

    async fn heartbeat_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            let min = self.cfg.heartbeat_min_sec.max(1);
            let max = self.cfg.heartbeat_max_sec.max(min);
            // Cheap jitter: spread heartbeats inside [min, max] without a RNG.
            let span = max - min + 1;
            let wait = min + (now_ms() as u64 % span);

            tokio::select! {
                c = stop.changed() => if c.is_err() || *stop.borrow() { return; },
                _ = sleep(Duration::from_secs(wait)) => {}
            }

            let freeze = self.paper.freeze_state();
            let mode = if freeze.entries_frozen { "FROZEN" } else { "NORMAL" };
            let tick_age_s =
                (now_ms() - self.state.last_tick_ms.load(Ordering::Relaxed)) / 1000;
            info!(
                mode,
                trigger = freeze.trigger_symbol.as_deref().unwrap_or("-"),
                last_tick_age_s = tick_age_s,
                paper_open = self.paper.open_count(),
                live_open = usize::from(self.live.has_position()),
                "HEARTBEAT"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Stream watchdog
    // -------------------------------------------------------------------------

    async fn ws_watchdog_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(1));
        let mut stale_hits: u32 = 0;
        // One reconnect per stale episode; rearms when frames flow again.
        let mut episode_fired = false;

        loop {
            tokio::select! {
                c = stop.changed() => if c.is_err() || *stop.borrow() { return; },
                _ = ticker.tick() => {}
            }

            let age_ms = now_ms() - self.state.last_ws_msg_ms.load(Ordering::Relaxed);
            if age_ms > self.cfg.ws_stale_sec as i64 * 1000 {
                stale_hits += 1;
                if stale_hits >= self.cfg.ws_stale_hits_to_reconnect && !episode_fired {
                    warn!(age_s = age_ms / 1000, "WS stale — requesting reconnect");
                    episode_fired = true;
                    self.ws_reconnect.notify_one();
                }
            } else {
                stale_hits = 0;
                episode_fired = false;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Paper timeout sweep
    // -------------------------------------------------------------------------

    /// Deadline enforcement even when a symbol's ticks went silent: snapshot
    /// the overdue positions, find a price for each, close best-effort.
    async fn paper_timeout_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(PAPER_SWEEP_SECS));

        loop {
            tokio::select! {
                c = stop.changed() => if c.is_err() || *stop.borrow() { return; },
                _ = ticker.tick() => {}
            }

            let overdue = self.paper.timed_out_symbols(now_secs());
            for symbol in overdue {
                let price = match self.resolve_price(&symbol).await {
                    Some(p) => p,
                    None => {
                        warn!(symbol = %symbol, "timeout sweep: no price — leaving until next tick");
                        continue;
                    }
                };
                // Only closes if the position is still present.
                let _ = self
                    .paper
                    .close(&symbol, price, CloseReason::Timeout, now_secs());
            }
        }
    }

    /// Last tick price, then book mid, then last trade price from REST.
    async fn resolve_price(&self, symbol: &str) -> Option<f64> {
        if let Some(p) = self.state.last_prices.read().get(symbol).copied() {
            if p > 0.0 {
                return Some(p);
            }
        }
        if let Ok(book) = self.gateway.book_ticker(symbol).await {
            let mid = book.mid();
            if mid > 0.0 {
                return Some(mid);
            }
        }
        match self.gateway.ticker_price(symbol).await {
            Ok(p) if p > 0.0 => Some(p),
            _ => None,
        }
    }
}
