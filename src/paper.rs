// =============================================================================
// Paper engine — shadow positions, loss streaks, and the freeze/arm protocol
// =============================================================================
//
// At most one paper position per symbol. Closes update the per-symbol loss
// streak; when a symbol's streak reaches `loss_streak_to_arm` the engine
// freezes: no new paper entries anywhere, no further streak updates, and the
// offending symbol becomes the live trigger. Existing positions keep running
// to their own close. Only `reset_all_streaks` (called by the orchestrator
// after a live close) clears the freeze.
//
// All state sits behind one mutex; the tick path and the timeout sweeper are
// the only mutators.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::logs::{CsvLog, PaperEvent, PaperRecord};
use crate::types::{CloseReason, Side};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One simulated position.
#[derive(Debug, Clone)]
pub struct PaperPosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub qty: f64,
    pub tp_price: f64,
    pub sl_price: f64,
    /// Unix seconds.
    pub opened_at: i64,
}

/// Result of a paper close, returned to the tick path for observability.
#[derive(Debug, Clone)]
pub struct PaperClose {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_pct: f64,
    pub pnl_usd: f64,
    pub reason: CloseReason,
    /// Streak value after this close (unchanged while streaks are frozen).
    pub streak: u32,
    /// This close armed the live trigger.
    pub armed: bool,
}

/// The freeze/arm flags shared between paper closes and the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct FreezeState {
    pub entries_frozen: bool,
    pub streaks_frozen: bool,
    pub trigger_symbol: Option<String>,
}

#[derive(Default)]
struct Inner {
    positions: HashMap<String, PaperPosition>,
    streaks: HashMap<String, u32>,
    freeze: FreezeState,
    /// Per-symbol unix-seconds of the last close, for the cooldown gate.
    last_close_at: HashMap<String, i64>,
    /// Unix-seconds of recent opens, pruned to a one-hour window.
    opens_window: VecDeque<i64>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct PaperEngine {
    cfg: Arc<Config>,
    log: CsvLog,
    inner: Mutex<Inner>,
}

impl PaperEngine {
    pub fn new(cfg: Arc<Config>, log: CsvLog) -> Self {
        Self {
            cfg,
            log,
            inner: Mutex::new(Inner::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Entry gates
    // -------------------------------------------------------------------------

    /// All preconditions for opening a paper position on `symbol` at `now`
    /// (unix seconds): not frozen, no existing position, cooldown elapsed,
    /// hourly open count under the cap (0 = unlimited).
    pub fn can_open(&self, symbol: &str, now: i64) -> bool {
        if !self.cfg.paper_enabled {
            return false;
        }
        let mut inner = self.inner.lock();

        if inner.freeze.entries_frozen {
            return false;
        }
        if inner.positions.contains_key(symbol) {
            return false;
        }

        let cooldown = self.cfg.cooldown_after_trade_sec as i64;
        if cooldown > 0 {
            if let Some(&last) = inner.last_close_at.get(symbol) {
                if now - last < cooldown {
                    return false;
                }
            }
        }

        let cap = self.cfg.max_trades_per_hour;
        if cap > 0 {
            prune_hour_window(&mut inner.opens_window, now);
            if inner.opens_window.len() >= cap as usize {
                return false;
            }
        }

        true
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a paper position; a no-op returning `None` when the gates refuse.
    pub fn open(&self, symbol: &str, side: Side, price: f64, now: i64) -> Option<PaperPosition> {
        if price <= 0.0 || !self.can_open(symbol, now) {
            return None;
        }

        let qty = self.cfg.trade_notional_usd / price;
        let tp_frac = self.cfg.tp_pct / 100.0;
        let sl_frac = self.cfg.sl_pct / 100.0;
        let (tp_price, sl_price) = match side {
            Side::Long => (price * (1.0 + tp_frac), price * (1.0 - sl_frac)),
            Side::Short => (price * (1.0 - tp_frac), price * (1.0 + sl_frac)),
        };

        let pos = PaperPosition {
            symbol: symbol.to_string(),
            side,
            entry_price: price,
            qty,
            tp_price,
            sl_price,
            opened_at: now,
        };

        {
            let mut inner = self.inner.lock();
            // can_open raced with another open; keep the singleton invariant.
            if inner.freeze.entries_frozen || inner.positions.contains_key(symbol) {
                return None;
            }
            inner.positions.insert(symbol.to_string(), pos.clone());
            inner.opens_window.push_back(now);
            prune_hour_window(&mut inner.opens_window, now);
        }

        info!(
            symbol,
            side = %side,
            entry = price,
            tp = tp_price,
            sl = sl_price,
            "PAPER OPEN"
        );

        if let Err(e) = self.log.append(&PaperRecord {
            ts: now,
            symbol: symbol.to_string(),
            side: side.to_string(),
            event: PaperEvent::Open,
            entry: price,
            exit: None,
            tp: tp_price,
            sl: sl_price,
            pnl_pct: None,
            net_pnl_usd: None,
            reason: None,
        }) {
            warn!(error = %e, "paper log append failed");
        }

        Some(pos)
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Evaluate the close triggers for `symbol` against a fresh price, in
    /// priority order: TP, then SL, then holding timeout.
    pub fn close_on_price(&self, symbol: &str, price: f64, now: i64) -> Option<PaperClose> {
        let reason = {
            let inner = self.inner.lock();
            let pos = inner.positions.get(symbol)?;

            let tp_hit = match pos.side {
                Side::Long => price >= pos.tp_price,
                Side::Short => price <= pos.tp_price,
            };
            let sl_hit = match pos.side {
                Side::Long => price <= pos.sl_price,
                Side::Short => price >= pos.sl_price,
            };
            let timed_out = self.cfg.max_holding_sec > 0
                && now - pos.opened_at >= self.cfg.max_holding_sec as i64;

            if tp_hit {
                CloseReason::Tp
            } else if sl_hit {
                CloseReason::Sl
            } else if timed_out {
                CloseReason::Timeout
            } else {
                return None;
            }
        };

        self.close(symbol, price, reason, now)
    }

    /// Close a paper position at `price` with the given reason, updating the
    /// streak table and (possibly) arming the freeze.
    pub fn close(
        &self,
        symbol: &str,
        price: f64,
        reason: CloseReason,
        now: i64,
    ) -> Option<PaperClose> {
        let (result, tp_price, sl_price) = {
            let mut inner = self.inner.lock();
            let pos = inner.positions.remove(symbol)?;
            inner.last_close_at.insert(symbol.to_string(), now);

            let (pnl_pct, pnl_usd) = paper_pnl(pos.side, pos.entry_price, price, pos.qty);

            let mut armed = false;
            let streak = if inner.freeze.streaks_frozen {
                inner.streaks.get(symbol).copied().unwrap_or(0)
            } else {
                let next = next_streak(
                    inner.streaks.get(symbol).copied().unwrap_or(0),
                    &reason,
                    pnl_usd,
                );
                inner.streaks.insert(symbol.to_string(), next);

                if !inner.freeze.entries_frozen && next >= self.cfg.loss_streak_to_arm {
                    inner.freeze = FreezeState {
                        entries_frozen: true,
                        streaks_frozen: true,
                        trigger_symbol: Some(symbol.to_string()),
                    };
                    armed = true;
                }
                next
            };

            (
                PaperClose {
                    symbol: symbol.to_string(),
                    side: pos.side,
                    entry_price: pos.entry_price,
                    exit_price: price,
                    pnl_pct,
                    pnl_usd,
                    reason,
                    streak,
                    armed,
                },
                pos.tp_price,
                pos.sl_price,
            )
        };

        info!(
            symbol,
            side = %result.side,
            exit = price,
            pnl_pct = format!("{:.3}", result.pnl_pct),
            pnl_usd = format!("{:.4}", result.pnl_usd),
            reason = %result.reason,
            streak = result.streak,
            "PAPER CLOSE"
        );
        if result.armed {
            info!(symbol, streak = result.streak, "ARM — paper entries frozen, live trigger set");
        }

        if let Err(e) = self.log.append(&PaperRecord {
            ts: now,
            symbol: result.symbol.clone(),
            side: result.side.to_string(),
            event: PaperEvent::Close,
            entry: result.entry_price,
            exit: Some(price),
            tp: tp_price,
            sl: sl_price,
            pnl_pct: Some(result.pnl_pct),
            net_pnl_usd: Some(result.pnl_usd),
            reason: Some(result.reason.to_string()),
        }) {
            warn!(error = %e, "paper log append failed");
        }

        Some(result)
    }

    // -------------------------------------------------------------------------
    // Timeout sweep support
    // -------------------------------------------------------------------------

    /// Symbols whose paper position has exceeded the holding deadline. A
    /// snapshot; the sweeper closes each only if it is still present.
    pub fn timed_out_symbols(&self, now: i64) -> Vec<String> {
        if self.cfg.max_holding_sec == 0 {
            return Vec::new();
        }
        let deadline = self.cfg.max_holding_sec as i64;
        self.inner
            .lock()
            .positions
            .values()
            .filter(|p| now - p.opened_at >= deadline)
            .map(|p| p.symbol.clone())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Freeze / reset
    // -------------------------------------------------------------------------

    /// Clear every streak and the freeze flags. Invoked by the orchestrator
    /// exactly once after a confirmed live close.
    pub fn reset_all_streaks(&self) {
        let mut inner = self.inner.lock();
        for v in inner.streaks.values_mut() {
            *v = 0;
        }
        inner.freeze = FreezeState::default();
        drop(inner);
        info!("RESET — streaks cleared, freeze lifted");
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn freeze_state(&self) -> FreezeState {
        self.inner.lock().freeze.clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().freeze.entries_frozen
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.inner.lock().positions.contains_key(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().positions.len()
    }

    pub fn streak(&self, symbol: &str) -> u32 {
        self.inner.lock().streaks.get(symbol).copied().unwrap_or(0)
    }

    /// Lazily create zero streak entries for newly active symbols.
    pub fn ensure_symbols(&self, symbols: &[String]) {
        let mut inner = self.inner.lock();
        for s in symbols {
            inner.streaks.entry(s.clone()).or_insert(0);
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn prune_hour_window(window: &mut VecDeque<i64>, now: i64) {
    while let Some(&oldest) = window.front() {
        if now - oldest > 3600 {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Pnl percent and dollars for a paper exit.
fn paper_pnl(side: Side, entry: f64, exit: f64, qty: f64) -> (f64, f64) {
    match side {
        Side::Long => {
            let pct = if entry > 0.0 { (exit / entry - 1.0) * 100.0 } else { 0.0 };
            (pct, qty * (exit - entry))
        }
        Side::Short => {
            let pct = if exit > 0.0 { (entry / exit - 1.0) * 100.0 } else { 0.0 };
            (pct, qty * (entry - exit))
        }
    }
}

/// Streak transition on close: SL always counts, TP always clears, a timeout
/// counts unless it exited in profit, anything else counts only on a loss.
fn next_streak(current: u32, reason: &CloseReason, pnl_usd: f64) -> u32 {
    let is_loss = match reason {
        CloseReason::Sl => true,
        CloseReason::Tp => false,
        CloseReason::Timeout => pnl_usd <= 0.0,
        _ => pnl_usd < 0.0,
    };
    if is_loss {
        current + 1
    } else {
        0
    }
}
