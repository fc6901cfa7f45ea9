// =============================================================================
// Signal engine — breakout impulse gated by volatility and spread
// =============================================================================
//
// A symbol signals LONG when its short-window impulse return clears the
// breakout buffer while the market is volatile enough (ATR% floor) and tight
// enough (spread% ceiling); SHORT mirrors the impulse side. An unknown spread
// or an insufficient ATR always yields no signal.
// =============================================================================

use tracing::trace;

use crate::config::Config;
use crate::types::Side;

/// Inputs gathered on the tick path for one symbol.
#[derive(Debug, Clone, Copy)]
pub struct SignalInputs {
    /// Impulse return over the configured lookback, percent.
    pub impulse_pct: Option<f64>,
    /// ATR over the configured period divided by last price, percent.
    pub atr_pct: Option<f64>,
    /// Latest cached book spread, percent of mid.
    pub spread_pct: Option<f64>,
}

/// Evaluate the gates and return the signalled side, if any.
///
/// A zero `min_atr_pct` disables the ATR gate entirely, so symbols without
/// enough closed bars yet can still signal; any positive floor requires a
/// known ATR.
pub fn evaluate(symbol: &str, inputs: &SignalInputs, cfg: &Config) -> Option<Side> {
    let impulse = inputs.impulse_pct?;

    if cfg.min_atr_pct > 0.0 {
        let atr_pct = inputs.atr_pct?;
        if atr_pct < cfg.min_atr_pct {
            trace!(symbol, atr_pct, "signal blocked: ATR below floor");
            return None;
        }
    }

    let spread_pct = inputs.spread_pct?;
    if spread_pct > cfg.max_spread_pct {
        trace!(symbol, spread_pct, "signal blocked: spread above ceiling");
        return None;
    }

    if impulse >= cfg.breakout_buffer_pct {
        Some(Side::Long)
    } else if impulse <= -cfg.breakout_buffer_pct {
        Some(Side::Short)
    } else {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut cfg = Config::default();
        cfg.breakout_buffer_pct = 0.10;
        cfg.min_atr_pct = 0.03;
        cfg.max_spread_pct = 0.10;
        cfg
    }

    fn inputs(impulse: f64, atr: f64, spread: f64) -> SignalInputs {
        SignalInputs {
            impulse_pct: Some(impulse),
            atr_pct: Some(atr),
            spread_pct: Some(spread),
        }
    }

    #[test]
    fn long_on_positive_breakout() {
        let s = evaluate("BTCUSDT", &inputs(0.15, 0.05, 0.05), &cfg());
        assert_eq!(s, Some(Side::Long));
    }

    #[test]
    fn short_on_negative_breakout() {
        let s = evaluate("BTCUSDT", &inputs(-0.15, 0.05, 0.05), &cfg());
        assert_eq!(s, Some(Side::Short));
    }

    #[test]
    fn buffer_boundary_is_inclusive() {
        assert_eq!(
            evaluate("A", &inputs(0.10, 0.05, 0.05), &cfg()),
            Some(Side::Long)
        );
        assert_eq!(
            evaluate("A", &inputs(-0.10, 0.05, 0.05), &cfg()),
            Some(Side::Short)
        );
        assert_eq!(evaluate("A", &inputs(0.09, 0.05, 0.05), &cfg()), None);
    }

    #[test]
    fn atr_floor_blocks() {
        assert_eq!(evaluate("A", &inputs(0.5, 0.02, 0.05), &cfg()), None);
    }

    #[test]
    fn spread_ceiling_blocks() {
        assert_eq!(evaluate("A", &inputs(0.5, 0.05, 0.20), &cfg()), None);
    }

    #[test]
    fn unknown_inputs_block() {
        let c = cfg();
        let mut i = inputs(0.5, 0.05, 0.05);
        i.spread_pct = None;
        assert_eq!(evaluate("A", &i, &c), None);

        let mut i = inputs(0.5, 0.05, 0.05);
        i.atr_pct = None;
        assert_eq!(evaluate("A", &i, &c), None);

        let mut i = inputs(0.5, 0.05, 0.05);
        i.impulse_pct = None;
        assert_eq!(evaluate("A", &i, &c), None);
    }

    #[test]
    fn zero_atr_floor_disables_the_gate() {
        let mut c = cfg();
        c.min_atr_pct = 0.0;
        // No closed bars yet: ATR unknown, but the gate is off.
        let mut i = inputs(0.15, 0.0, 0.05);
        i.atr_pct = None;
        assert_eq!(evaluate("A", &i, &c), Some(Side::Long));
    }
}
