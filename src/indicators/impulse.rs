// =============================================================================
// Impulse return — percent move over a short tick lookback
// =============================================================================

use std::collections::VecDeque;

/// Percent change between the latest tick and the oldest tick inside the
/// lookback window. When no sample falls inside the window the earliest
/// retained sample is used instead.
///
/// Returns `None` with fewer than two samples or a non-positive base price.
pub fn impulse_return_pct(
    ticks: &VecDeque<(i64, f64)>,
    now_ms: i64,
    lookback_sec: u64,
) -> Option<f64> {
    if ticks.len() < 2 {
        return None;
    }

    let cutoff = now_ms - (lookback_sec as i64) * 1000;
    let &(_, old_price) = ticks
        .iter()
        .find(|(ts, _)| *ts >= cutoff)
        .or_else(|| ticks.front())?;
    let &(_, last_price) = ticks.back()?;

    if old_price <= 0.0 {
        return None;
    }
    Some((last_price - old_price) / old_price * 100.0)
}
