// =============================================================================
// Live engine — single real position with on-exchange brackets
// =============================================================================
//
// Holds at most one live position. The venue's positionRisk endpoint is the
// source of truth: every watch poll reconciles against it, and a confirmed
// close is only confirmed once it reports flat. Entry quantities round DOWN
// to the step size; bracket stop prices round DOWN to the tick size.
//
// Only `open_live` and `watch_until_close` mutate live state, and the
// orchestrator calls them sequentially, so a plain mutex over the position
// slot is enough.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration};
use tracing::{info, warn};

use crate::config::Config;
use crate::gateway::{ConditionalKind, ExchangeGateway, GatewayError, SymbolFilters, UserTrade};
use crate::logs::{CsvLog, LiveRecord};
use crate::types::{now_ms, now_secs, CloseReason, Side};

/// Last trade prices shared with the orchestrator's tick path.
pub type SharedPrices = Arc<RwLock<HashMap<String, f64>>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("a live position is already open")]
    Capacity,

    #[error("quantity {qty} below exchange minimum {min}")]
    MinQty { qty: Decimal, min: Decimal },

    #[error("notional {notional} below exchange minimum {min}")]
    MinNotional { notional: Decimal, min: Decimal },

    #[error("last price deviates {deviation_pct:.3}% from book mid (limit {limit_pct}%)")]
    Deviation { deviation_pct: f64, limit_pct: f64 },

    #[error("entry order not reflected in position risk")]
    OpenUnconfirmed,

    #[error("close not confirmed after {attempts} attempts")]
    CloseFailed { attempts: u32 },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The one live position, mirrored from the venue after confirmation.
#[derive(Debug, Clone)]
pub struct LivePosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub qty: Decimal,
    pub opened_at_ms: i64,
    pub entry_order_id: i64,
    pub tp_order_id: Option<i64>,
    pub sl_order_id: Option<i64>,
}

/// Settled result of one live trade, as logged to CSV.
#[derive(Debug, Clone)]
pub struct LiveOutcome {
    pub symbol: String,
    pub side: Side,
    pub entry: f64,
    pub exit: f64,
    pub pnl_pct: f64,
    pub net_pnl: f64,
    pub outcome: &'static str,
    pub reason: CloseReason,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct LiveEngine {
    gateway: Arc<ExchangeGateway>,
    cfg: Arc<Config>,
    log: CsvLog,
    /// exchangeInfo filter cache, filled on first use.
    filters: RwLock<HashMap<String, SymbolFilters>>,
    position: Mutex<Option<LivePosition>>,
}

impl LiveEngine {
    pub fn new(gateway: Arc<ExchangeGateway>, cfg: Arc<Config>, log: CsvLog) -> Self {
        Self {
            gateway,
            cfg,
            log,
            filters: RwLock::new(HashMap::new()),
            position: Mutex::new(None),
        }
    }

    pub fn position(&self) -> Option<LivePosition> {
        self.position.lock().clone()
    }

    pub fn has_position(&self) -> bool {
        self.position.lock().is_some()
    }

    async fn filters_for(&self, symbol: &str) -> Result<SymbolFilters, LiveError> {
        if let Some(f) = self.filters.read().get(symbol) {
            return Ok(f.clone());
        }
        let info = self.gateway.exchange_info().await?;
        *self.filters.write() = info;
        self.filters.read().get(symbol).cloned().ok_or_else(|| {
            LiveError::Gateway(GatewayError::NotFound(format!(
                "{symbol} missing from exchangeInfo"
            )))
        })
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a live position: size it, guard it, enter at market, confirm
    /// against positionRisk, and protect it with reduce-only TP/SL brackets.
    pub async fn open_live(
        &self,
        symbol: &str,
        side: Side,
        last_price: f64,
    ) -> Result<LivePosition, LiveError> {
        // 1. Capacity: reconcile any local position first; a remote position
        //    unknown to us also blocks entry.
        let existing = self.position.lock().clone();
        if let Some(pos) = existing {
            self.reconcile(&pos.symbol).await?;
            if self.position.lock().is_some() {
                return Err(LiveError::Capacity);
            }
        }
        let remote = self.gateway.position_risk(symbol).await?;
        if remote
            .iter()
            .any(|p| p.symbol == symbol && !p.position_amt.is_zero())
        {
            warn!(symbol, "venue already reports a position — refusing entry");
            return Err(LiveError::Capacity);
        }

        // 2. Exchange metadata and leverage.
        let filters = self.filters_for(symbol).await?;
        self.gateway
            .set_leverage(symbol, self.cfg.live_leverage)
            .await?;

        // 3. Size the order.
        let qty = size_order(
            self.cfg.live_notional_usd,
            self.cfg.live_leverage,
            last_price,
            &filters,
        )?;

        // 4. Deviation guard against the current book mid.
        if self.cfg.max_deviation_pct > 0.0 {
            let book = self.gateway.book_ticker(symbol).await?;
            let mid = book.mid();
            if mid > 0.0 {
                let deviation_pct = ((last_price - mid) / mid * 100.0).abs();
                if deviation_pct > self.cfg.max_deviation_pct {
                    return Err(LiveError::Deviation {
                        deviation_pct,
                        limit_pct: self.cfg.max_deviation_pct,
                    });
                }
            }
        }

        // 5. Market entry; entry price is optimistic until confirmed.
        let ack = self
            .gateway
            .place_market(symbol, side.entry_order_side(), qty, false)
            .await?;
        // Some venues ack a market order before the fill lands; re-query the
        // order for its average price when the ack carries none.
        let mut entry_price = ack.avg_price.unwrap_or(0.0);
        if entry_price <= 0.0 {
            match self.gateway.order(symbol, ack.order_id).await {
                Ok(od) => entry_price = od.avg_price.unwrap_or(last_price),
                Err(e) => {
                    warn!(symbol, error = %e, "entry order re-query failed — using last price");
                    entry_price = last_price;
                }
            }
        }
        let mut pos = LivePosition {
            symbol: symbol.to_string(),
            side,
            entry_price,
            qty,
            opened_at_ms: now_ms(),
            entry_order_id: ack.order_id,
            tp_order_id: None,
            sl_order_id: None,
        };
        *self.position.lock() = Some(pos.clone());
        info!(
            symbol,
            side = %side,
            qty = %qty,
            entry = pos.entry_price,
            order_id = ack.order_id,
            "LIVE OPEN submitted"
        );

        // 6. Confirm against the remote position store.
        let remote = self.gateway.position_risk(symbol).await?;
        let Some(r) = remote
            .iter()
            .find(|p| p.symbol == symbol && !p.position_amt.is_zero())
        else {
            *self.position.lock() = None;
            return Err(LiveError::OpenUnconfirmed);
        };
        pos.side = if r.position_amt > Decimal::ZERO {
            Side::Long
        } else {
            Side::Short
        };
        pos.qty = r.position_amt.abs();
        if r.entry_price > 0.0 {
            pos.entry_price = r.entry_price;
        }
        *self.position.lock() = Some(pos.clone());

        // 7. Brackets from the confirmed entry, after clearing leftovers.
        let entry_dec = Decimal::from_f64_retain(pos.entry_price).ok_or_else(|| {
            LiveError::Gateway(GatewayError::Parse(format!(
                "unrepresentable entry price {}",
                pos.entry_price
            )))
        })?;
        let (tp_price, sl_price) = bracket_prices(
            entry_dec,
            pos.side,
            self.cfg.tp_pct,
            self.cfg.sl_pct,
            filters.tick_size,
        );

        if let Err(e) = self.gateway.cancel_all(symbol).await {
            warn!(symbol, error = %e, "leftover order cleanup failed before brackets");
        }

        let close_side = pos.side.close_order_side();
        let tp_ack = match self
            .gateway
            .place_conditional_close(
                symbol,
                close_side,
                ConditionalKind::TakeProfitMarket,
                tp_price,
                pos.qty,
            )
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.unwind_unprotected(symbol, close_side, pos.qty).await;
                return Err(e.into());
            }
        };
        pos.tp_order_id = Some(tp_ack.order_id);
        *self.position.lock() = Some(pos.clone());

        let sl_ack = match self
            .gateway
            .place_conditional_close(
                symbol,
                close_side,
                ConditionalKind::StopMarket,
                sl_price,
                pos.qty,
            )
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                // Never leave a live position with only half a bracket.
                self.unwind_unprotected(symbol, close_side, pos.qty).await;
                return Err(e.into());
            }
        };
        pos.sl_order_id = Some(sl_ack.order_id);
        *self.position.lock() = Some(pos.clone());

        info!(
            symbol,
            side = %pos.side,
            entry = pos.entry_price,
            qty = %pos.qty,
            tp = %tp_price,
            sl = %sl_price,
            tp_order = tp_ack.order_id,
            sl_order = sl_ack.order_id,
            "LIVE brackets placed"
        );
        Ok(pos)
    }

    /// Best-effort unwind when bracket placement fails: cancel whatever leg
    /// went up and market-close the position, then drop local state.
    async fn unwind_unprotected(&self, symbol: &str, close_side: &str, qty: Decimal) {
        warn!(symbol, "bracket placement failed — unwinding unprotected position");
        if let Err(e) = self.gateway.cancel_all(symbol).await {
            warn!(symbol, error = %e, "unwind: cancel-all failed");
        }
        if let Err(e) = self
            .gateway
            .place_market(symbol, close_side, qty, true)
            .await
        {
            warn!(symbol, error = %e, "unwind: market close failed — position may remain open");
        }
        *self.position.lock() = None;
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Pull the authoritative position from the venue. A flat remote drops
    /// the local position; otherwise side/qty/entry are overwritten from the
    /// remote values. Idempotent when the venue is unchanged.
    pub async fn reconcile(&self, symbol: &str) -> Result<Option<LivePosition>, LiveError> {
        let rows = self.gateway.position_risk(symbol).await?;
        let remote = rows
            .into_iter()
            .find(|p| p.symbol == symbol && !p.position_amt.is_zero());

        let mut guard = self.position.lock();
        let local_matches = guard.as_ref().map(|p| p.symbol == symbol).unwrap_or(false);
        if !local_matches {
            return Ok(None);
        }

        match remote {
            None => {
                *guard = None;
                Ok(None)
            }
            Some(r) => {
                let pos = guard.as_mut().expect("checked above");
                pos.side = if r.position_amt > Decimal::ZERO {
                    Side::Long
                } else {
                    Side::Short
                };
                pos.qty = r.position_amt.abs();
                if r.entry_price > 0.0 {
                    pos.entry_price = r.entry_price;
                }
                Ok(Some(pos.clone()))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Watch
    // -------------------------------------------------------------------------

    /// Monitor the live position until it closes, enforcing the profit and
    /// hard deadlines. Returns the settled outcome, or `None` when there was
    /// no position to watch.
    pub async fn watch_until_close(
        &self,
        prices: &SharedPrices,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Option<LiveOutcome>, LiveError> {
        let Some(mut pos) = self.position.lock().clone() else {
            return Ok(None);
        };
        let symbol = pos.symbol.clone();
        let t0 = pos.opened_at_ms;
        // The profit deadline fires at most once per live trade.
        let mut profit_deadline = Some(t0 + self.cfg.watch_profit_timeout_sec as i64 * 1000);
        let mut hard_deadline = t0 + self.cfg.watch_hard_timeout_sec as i64 * 1000;

        // Poll cadence: never let a slow poll setting starve reconciliation.
        let poll_sec = self
            .cfg
            .watch_poll_sec
            .min(self.cfg.live_reconcile_every_sec.max(1))
            .max(1);
        let mut ticker = interval(Duration::from_secs(poll_sec));
        info!(
            symbol,
            poll_sec = self.cfg.watch_poll_sec,
            profit_timeout_sec = self.cfg.watch_profit_timeout_sec,
            hard_timeout_sec = self.cfg.watch_hard_timeout_sec,
            "WATCH started"
        );

        loop {
            // The stop flag may already have flipped before this watch began.
            if *stop.borrow() {
                info!(symbol, "WATCH shutdown — forcing exit");
                self.close_live_confirmed(&symbol, &CloseReason::ForceExit).await?;
                return self
                    .settle(&pos, CloseReason::ForceExit, prices)
                    .await
                    .map(Some);
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        // Sender gone: the engine is tearing down.
                        info!(symbol, "WATCH stop channel closed — forcing exit");
                        self.close_live_confirmed(&symbol, &CloseReason::ForceExit).await?;
                        return self
                            .settle(&pos, CloseReason::ForceExit, prices)
                            .await
                            .map(Some);
                    }
                    // A value change is handled at the top of the next pass.
                }
                _ = ticker.tick() => {}
            }

            match self.reconcile(&symbol).await {
                Ok(None) => {
                    info!(symbol, "WATCH remote position flat — settling");
                    return self
                        .settle(&pos, CloseReason::CloseUnknownOrStopFilled, prices)
                        .await
                        .map(Some);
                }
                Ok(Some(updated)) => pos = updated,
                Err(e) => {
                    warn!(symbol, error = %e, "WATCH reconcile failed — retrying next poll");
                }
            }

            let now = now_ms();

            if let Some(deadline) = profit_deadline {
                if now >= deadline {
                    profit_deadline = None;
                    let px = prices.read().get(&symbol).copied().unwrap_or(0.0);
                    if px > 0.0 {
                        let pnl = pnl_pct(pos.side, pos.entry_price, px);
                        if pnl > 0.0 {
                            info!(symbol, pnl_pct = pnl, "WATCH profit timeout — closing in profit");
                            self.close_live_confirmed(&symbol, &CloseReason::TimeoutProfit)
                                .await?;
                            return self
                                .settle(&pos, CloseReason::TimeoutProfit, prices)
                                .await
                                .map(Some);
                        }
                        info!(symbol, pnl_pct = pnl, "WATCH profit timeout reached, not in profit — waiting on");
                    }
                }
            }

            if now >= hard_deadline {
                if self.cfg.emergency_close_on_hard_timeout {
                    warn!(symbol, "WATCH hard timeout — emergency close");
                    self.close_live_confirmed(&symbol, &CloseReason::TimeoutHard)
                        .await?;
                    return self
                        .settle(&pos, CloseReason::TimeoutHard, prices)
                        .await
                        .map(Some);
                }
                warn!(symbol, "WATCH hard timeout — leaving position under its brackets, timer re-armed");
                hard_deadline = now + self.cfg.watch_hard_timeout_sec as i64 * 1000;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Confirmed close
    // -------------------------------------------------------------------------

    /// Close the live position with retries until positionRisk reports flat.
    /// Returns `true` when the position was already flat before we sent
    /// anything.
    pub async fn close_live_confirmed(
        &self,
        symbol: &str,
        reason: &CloseReason,
    ) -> Result<bool, LiveError> {
        let attempts = self.cfg.live_close_retries.max(1);
        let step = self.filters_for(symbol).await.ok().map(|f| f.step_size);
        let mut sent_close = false;

        for attempt in 1..=attempts {
            let amt = match self.gateway.position_risk(symbol).await {
                Ok(rows) => rows
                    .iter()
                    .find(|p| p.symbol == symbol)
                    .map(|p| p.position_amt)
                    .unwrap_or(Decimal::ZERO),
                Err(e) => {
                    warn!(symbol, attempt, error = %e, "close: positionRisk failed");
                    sleep(Duration::from_secs(self.cfg.live_close_retry_sleep_sec)).await;
                    continue;
                }
            };

            if amt.is_zero() {
                let already_flat = !sent_close;
                if already_flat {
                    info!(symbol, reason = %reason, "close: already flat");
                }
                let mut guard = self.position.lock();
                if guard.as_ref().map(|p| p.symbol == symbol).unwrap_or(false) {
                    *guard = None;
                }
                return Ok(already_flat);
            }

            let close_side = if amt > Decimal::ZERO { "SELL" } else { "BUY" };
            let mut qty = amt.abs();
            if let Some(step) = step {
                let rounded = quantize_down(qty, step);
                if !rounded.is_zero() {
                    qty = rounded;
                }
            }

            info!(
                symbol,
                attempt,
                qty = %qty,
                side = close_side,
                reason = %reason,
                "close: submitting reduce-only market order"
            );
            match self
                .gateway
                .place_market(symbol, close_side, qty, true)
                .await
            {
                Ok(_) => sent_close = true,
                Err(e) => warn!(symbol, attempt, error = %e, "close: market order failed"),
            }

            sleep(Duration::from_secs(self.cfg.live_close_retry_sleep_sec)).await;
        }

        // Final confirmation read after the last attempt.
        if let Ok(rows) = self.gateway.position_risk(symbol).await {
            let flat = rows
                .iter()
                .find(|p| p.symbol == symbol)
                .map(|p| p.position_amt.is_zero())
                .unwrap_or(true);
            if flat {
                let mut guard = self.position.lock();
                if guard.as_ref().map(|p| p.symbol == symbol).unwrap_or(false) {
                    *guard = None;
                }
                return Ok(false);
            }
        }

        warn!(symbol, attempts, "CLOSE FAILED — position may still be open");
        Err(LiveError::CloseFailed { attempts })
    }

    // -------------------------------------------------------------------------
    // Settlement
    // -------------------------------------------------------------------------

    /// Derive the realized outcome from account trade history, refine the
    /// close reason against the bracket order ids, log the CSV row, and drop
    /// local state.
    async fn settle(
        &self,
        pos: &LivePosition,
        base_reason: CloseReason,
        prices: &SharedPrices,
    ) -> Result<LiveOutcome, LiveError> {
        if let Err(e) = self.gateway.cancel_all(&pos.symbol).await {
            warn!(symbol = %pos.symbol, error = %e, "settle: cancel-all failed");
        }
        if let Ok(remaining) = self.gateway.open_orders(&pos.symbol).await {
            if !remaining.is_empty() {
                warn!(
                    symbol = %pos.symbol,
                    count = remaining.len(),
                    "settle: orders still open after cancel-all"
                );
            }
        }

        let trades = match self
            .gateway
            .user_trades(&pos.symbol, pos.opened_at_ms - 10_000, now_ms(), 100)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!(symbol = %pos.symbol, error = %e, "settle: userTrades failed — falling back to price delta");
                Vec::new()
            }
        };

        let exit_trade = pick_exit_trade(&trades, pos.entry_order_id);
        let qty_f64 = pos.qty.to_f64().unwrap_or(0.0);

        let (exit_price, realized, exit_order_id) = match exit_trade {
            Some(t) => (t.price, Some(t.realized_pnl), Some(t.order_id)),
            None => {
                // No exit fill found: approximate from the last seen price.
                let px = prices
                    .read()
                    .get(&pos.symbol)
                    .copied()
                    .filter(|p| *p > 0.0)
                    .unwrap_or(pos.entry_price);
                (px, None, None)
            }
        };

        let pct = pnl_pct(pos.side, pos.entry_price, exit_price);
        let net = realized.unwrap_or_else(|| qty_f64 * pos.entry_price * pct / 100.0);
        let reason = refine_reason(
            base_reason,
            exit_order_id,
            pos.tp_order_id,
            pos.sl_order_id,
        );
        let outcome = if net > 0.0 {
            "WIN"
        } else if net < 0.0 {
            "LOSS"
        } else {
            "FLAT"
        };

        info!(
            symbol = %pos.symbol,
            side = %pos.side,
            entry = pos.entry_price,
            exit = exit_price,
            pnl_pct = format!("{pct:.3}"),
            net_pnl = format!("{net:.4}"),
            outcome,
            reason = %reason,
            "LIVE CLOSE"
        );

        if let Err(e) = self.log.append(&LiveRecord {
            ts: now_secs(),
            symbol: pos.symbol.clone(),
            side: pos.side.to_string(),
            entry: pos.entry_price,
            exit: exit_price,
            qty: pos.qty.normalize().to_string(),
            leverage: self.cfg.live_leverage,
            pnl_pct: pct,
            net_pnl_usd: net,
            outcome: outcome.to_string(),
            reason: reason.to_string(),
            order_id_entry: pos.entry_order_id,
            order_id_exit: exit_order_id,
        }) {
            warn!(error = %e, "live log append failed");
        }

        let mut guard = self.position.lock();
        if guard
            .as_ref()
            .map(|p| p.symbol == pos.symbol)
            .unwrap_or(false)
        {
            *guard = None;
        }
        drop(guard);

        Ok(LiveOutcome {
            symbol: pos.symbol.clone(),
            side: pos.side,
            entry: pos.entry_price,
            exit: exit_price,
            pnl_pct: pct,
            net_pnl: net,
            outcome,
            reason,
        })
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Round `value` DOWN to an integer multiple of `step`.
fn quantize_down(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

/// Size a live order: `notional × leverage / price`, rounded DOWN to the step
/// size, then checked against the venue minimums.
fn size_order(
    notional_usd: f64,
    leverage: u32,
    price: f64,
    filters: &SymbolFilters,
) -> Result<Decimal, LiveError> {
    let raw = Decimal::from_f64_retain(notional_usd * leverage as f64 / price)
        .unwrap_or(Decimal::ZERO);
    let qty = quantize_down(raw, filters.step_size);

    if qty < filters.min_qty || qty.is_zero() {
        return Err(LiveError::MinQty {
            qty,
            min: filters.min_qty,
        });
    }

    let price_dec = Decimal::from_f64_retain(price).unwrap_or(Decimal::ZERO);
    let notional = qty * price_dec * Decimal::from(leverage);
    if notional < filters.min_notional {
        return Err(LiveError::MinNotional {
            notional,
            min: filters.min_notional,
        });
    }

    Ok(qty)
}

/// TP/SL stop prices from the confirmed entry, both rounded DOWN to the tick.
fn bracket_prices(
    entry: Decimal,
    side: Side,
    tp_pct: f64,
    sl_pct: f64,
    tick: Decimal,
) -> (Decimal, Decimal) {
    let hundred = Decimal::from(100);
    let tp_frac = Decimal::from_f64_retain(tp_pct).unwrap_or(Decimal::ZERO) / hundred;
    let sl_frac = Decimal::from_f64_retain(sl_pct).unwrap_or(Decimal::ZERO) / hundred;

    let (tp, sl) = match side {
        Side::Long => (
            entry * (Decimal::ONE + tp_frac),
            entry * (Decimal::ONE - sl_frac),
        ),
        Side::Short => (
            entry * (Decimal::ONE - tp_frac),
            entry * (Decimal::ONE + sl_frac),
        ),
    };
    (quantize_down(tp, tick), quantize_down(sl, tick))
}

/// Settlement pnl percent: longs gain as price rises, shorts as it falls.
fn pnl_pct(side: Side, entry: f64, exit: f64) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    match side {
        Side::Long => (exit - entry) / entry * 100.0,
        Side::Short => (entry - exit) / entry * 100.0,
    }
}

/// The latest fill whose order is NOT the entry order is taken as the exit.
fn pick_exit_trade(trades: &[UserTrade], entry_order_id: i64) -> Option<&UserTrade> {
    trades
        .iter()
        .filter(|t| t.order_id != entry_order_id)
        .max_by_key(|t| t.time)
}

/// Upgrade the base reason when the exit fill matches a bracket order.
fn refine_reason(
    base: CloseReason,
    exit_order_id: Option<i64>,
    tp_order_id: Option<i64>,
    sl_order_id: Option<i64>,
) -> CloseReason {
    match exit_order_id {
        Some(oid) if tp_order_id == Some(oid) => CloseReason::TpExchange,
        Some(oid) if sl_order_id == Some(oid) => CloseReason::SlExchange,
        _ => base,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn filters(step: &str, min_qty: &str, tick: &str, min_notional: &str) -> SymbolFilters {
        SymbolFilters {
            step_size: step.parse().unwrap(),
            min_qty: min_qty.parse().unwrap(),
            tick_size: tick.parse().unwrap(),
            min_notional: min_notional.parse().unwrap(),
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn quantize_rounds_down_to_step() {
        assert_eq!(quantize_down(dec("1.2345"), dec("0.01")), dec("1.23"));
        assert_eq!(quantize_down(dec("1.239"), dec("0.01")), dec("1.23"));
        assert_eq!(quantize_down(dec("0.009"), dec("0.01")), dec("0.00"));
        // Zero step passes the value through untouched.
        assert_eq!(quantize_down(dec("1.234"), Decimal::ZERO), dec("1.234"));
    }

    #[test]
    fn size_order_rounds_down_and_respects_minimums() {
        let f = filters("0.001", "0.001", "0.01", "5");
        // 50 * 2 / 300 = 0.3333... → 0.333
        let qty = size_order(50.0, 2, 300.0, &f).unwrap();
        assert_eq!(qty, dec("0.333"));
        // qty is an integer multiple of stepSize.
        assert!((qty % f.step_size).is_zero());
    }

    #[test]
    fn size_order_min_qty_rejection() {
        let f = filters("0.001", "0.01", "0.01", "0");
        // 1 * 1 / 200 = 0.005 < minQty 0.01
        let err = size_order(1.0, 1, 200.0, &f).unwrap_err();
        assert!(matches!(err, LiveError::MinQty { .. }));
    }

    #[test]
    fn size_order_min_notional_rejection() {
        let f = filters("0.001", "0.001", "0.01", "100");
        // qty = 0.033, notional = 0.033 * 300 * 1 = 9.9 < 100
        let err = size_order(10.0, 1, 300.0, &f).unwrap_err();
        assert!(matches!(err, LiveError::MinNotional { .. }));
    }

    #[test]
    fn bracket_prices_long() {
        // entry 100, tp 1%, sl 1%, tick 0.001.
        let (tp, sl) = bracket_prices(dec("100"), Side::Long, 1.0, 1.0, dec("0.001"));
        assert_eq!(tp, dec("101.000"));
        assert_eq!(sl, dec("99.000"));
    }

    #[test]
    fn bracket_prices_short_mirrors() {
        let (tp, sl) = bracket_prices(dec("100"), Side::Short, 1.0, 1.0, dec("0.001"));
        assert_eq!(tp, dec("99.000"));
        assert_eq!(sl, dec("101.000"));
    }

    #[test]
    fn bracket_prices_round_down_to_tick() {
        // entry 100.20, tp 1% → 101.202; with tick 0.01 rounds DOWN to 101.20.
        let (tp, sl) = bracket_prices(dec("100.20"), Side::Long, 1.0, 1.0, dec("0.01"));
        assert_eq!(tp, dec("101.20"));
        assert_eq!(sl, dec("99.19")); // 99.198 floored, not rounded to 99.20
    }

    #[test]
    fn pnl_pct_sides() {
        assert!((pnl_pct(Side::Long, 100.0, 101.0) - 1.0).abs() < 1e-12);
        assert!((pnl_pct(Side::Long, 100.0, 99.0) + 1.0).abs() < 1e-12);
        assert!((pnl_pct(Side::Short, 100.0, 99.0) - 1.0).abs() < 1e-12);
        assert!((pnl_pct(Side::Short, 100.0, 101.0) + 1.0).abs() < 1e-12);
        assert_eq!(pnl_pct(Side::Long, 0.0, 1.0), 0.0);
    }

    fn trade(order_id: i64, time: i64, price: f64) -> UserTrade {
        UserTrade {
            order_id,
            side: "SELL".into(),
            price,
            qty: 1.0,
            commission: 0.0,
            commission_asset: "USDT".into(),
            realized_pnl: 0.5,
            time,
        }
    }

    #[test]
    fn exit_trade_is_latest_non_entry() {
        let trades = vec![trade(1, 100, 10.0), trade(2, 200, 11.0), trade(3, 300, 12.0)];
        // Entry was order 1; latest of {2, 3} wins.
        let exit = pick_exit_trade(&trades, 1).unwrap();
        assert_eq!(exit.order_id, 3);

        // Only the entry fill present → no exit trade.
        let only_entry = vec![trade(1, 100, 10.0)];
        assert!(pick_exit_trade(&only_entry, 1).is_none());
    }

    #[test]
    fn reason_refinement_matches_bracket_ids() {
        let base = CloseReason::CloseUnknownOrStopFilled;
        assert_eq!(
            refine_reason(base.clone(), Some(7), Some(7), Some(8)),
            CloseReason::TpExchange
        );
        assert_eq!(
            refine_reason(base.clone(), Some(8), Some(7), Some(8)),
            CloseReason::SlExchange
        );
        assert_eq!(refine_reason(base.clone(), Some(9), Some(7), Some(8)), base);
        assert_eq!(refine_reason(base.clone(), None, Some(7), Some(8)), base);
    }
}
