// =============================================================================
// Universe builder — periodic selection of the active symbol set
// =============================================================================
//
// Selection modes:
//   WHITELIST_ONLY  — whitelist ∩ tradable − blacklist, nothing else.
//   HYBRID_PRIORITY — volume-ranked auto candidates merged with the whitelist
//                     (whitelist first when whitelist_priority is set).
//   AUTO_ONLY       — volume-ranked auto candidates only.
//
// Whitelist symbols are exempt from the 24 h volume floor. The result is
// deduplicated preserving order and truncated to target_symbols.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::{Config, SymbolMode};
use crate::gateway::ExchangeGateway;

pub struct UniverseBuilder {
    gateway: Arc<ExchangeGateway>,
    cfg: Arc<Config>,
}

impl UniverseBuilder {
    pub fn new(gateway: Arc<ExchangeGateway>, cfg: Arc<Config>) -> Self {
        Self { gateway, cfg }
    }

    /// Compute the active symbol list once. Gateway failures on the auto path
    /// degrade to the whitelist so a flaky metadata endpoint never empties the
    /// universe.
    pub async fn build_once(&self) -> Result<Vec<String>> {
        let cfg = &self.cfg;

        let tradable: HashSet<String> = match self.gateway.exchange_info().await {
            Ok(info) => info
                .keys()
                .filter(|s| s.ends_with(&cfg.quote))
                .cloned()
                .collect(),
            Err(e) => {
                warn!(error = %e, "exchangeInfo failed — falling back to whitelist");
                let fallback = apply_exclusions(&cfg.whitelist, cfg);
                return Ok(truncate(fallback, cfg.target_symbols));
            }
        };

        let ranked = if cfg.symbol_mode == SymbolMode::WhitelistOnly {
            Vec::new()
        } else {
            match self.gateway.tickers_24h().await {
                Ok(tickers) => {
                    let mut ranked: Vec<(String, f64)> = tickers
                        .into_iter()
                        .filter(|t| tradable.contains(&t.symbol))
                        .filter(|t| t.quote_volume > 0.0)
                        .map(|t| (t.symbol, t.quote_volume))
                        .collect();
                    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
                    ranked
                }
                Err(e) => {
                    warn!(error = %e, "24h tickers failed — falling back to whitelist");
                    Vec::new()
                }
            }
        };

        let active = select_active(cfg, &tradable, &ranked);
        info!(
            mode = %cfg.symbol_mode,
            tradable = tradable.len(),
            ranked = ranked.len(),
            active = active.len(),
            "universe built"
        );
        Ok(active)
    }
}

/// Pure selection over pre-fetched metadata; the async builder and the tests
/// share it.
pub fn select_active(
    cfg: &Config,
    tradable: &HashSet<String>,
    ranked_by_volume: &[(String, f64)],
) -> Vec<String> {
    let whitelist: Vec<String> = cfg
        .whitelist
        .iter()
        .filter(|s| tradable.contains(*s))
        .cloned()
        .collect();
    let wl = apply_exclusions(&whitelist, cfg);

    if cfg.symbol_mode == SymbolMode::WhitelistOnly {
        return truncate(wl, cfg.target_symbols);
    }

    let wl_set: HashSet<&String> = wl.iter().collect();
    let auto: Vec<String> = ranked_by_volume
        .iter()
        .filter(|(sym, _)| !cfg.blacklist.contains(sym) && !cfg.skip_symbols.contains(sym))
        .filter(|(sym, qv)| *qv >= cfg.min_24h_quote_vol || wl_set.contains(sym))
        .map(|(sym, _)| sym.clone())
        .take(cfg.auto_top_n)
        .collect();

    let merged = match cfg.symbol_mode {
        SymbolMode::AutoOnly => auto,
        SymbolMode::HybridPriority if cfg.whitelist_priority => {
            let mut out = wl.clone();
            out.extend(auto);
            out
        }
        _ => {
            let mut out = auto;
            out.extend(wl);
            out
        }
    };

    truncate(dedupe(merged), cfg.target_symbols)
}

fn apply_exclusions(symbols: &[String], cfg: &Config) -> Vec<String> {
    symbols
        .iter()
        .filter(|s| !cfg.blacklist.contains(s))
        .filter(|s| !cfg.skip_symbols.contains(s))
        .cloned()
        .collect()
}

fn dedupe(symbols: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

fn truncate(mut symbols: Vec<String>, target: usize) -> Vec<String> {
    symbols.truncate(target.max(1));
    symbols
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(mode: SymbolMode) -> Config {
        let mut cfg = Config::default();
        cfg.symbol_mode = mode;
        cfg.quote = "USDT".into();
        cfg.min_24h_quote_vol = 1000.0;
        cfg.auto_top_n = 3;
        cfg.target_symbols = 4;
        cfg
    }

    fn tradable(symbols: &[&str]) -> HashSet<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    fn ranked(rows: &[(&str, f64)]) -> Vec<(String, f64)> {
        rows.iter().map(|(s, v)| (s.to_string(), *v)).collect()
    }

    #[test]
    fn whitelist_only_is_subset_of_whitelist() {
        let mut c = cfg(SymbolMode::WhitelistOnly);
        c.whitelist = vec!["AAAUSDT".into(), "BBBUSDT".into(), "ZZZUSDT".into()];
        c.blacklist = vec!["BBBUSDT".into()];

        let t = tradable(&["AAAUSDT", "BBBUSDT", "CCCUSDT"]);
        let active = select_active(&c, &t, &[]);

        assert_eq!(active, vec!["AAAUSDT"]);
        for s in &active {
            assert!(c.whitelist.contains(s));
        }
    }

    #[test]
    fn hybrid_ranks_by_volume_and_truncates() {
        let c = cfg(SymbolMode::HybridPriority);
        let t = tradable(&["AUSDT", "BUSDT", "CUSDT", "DUSDT"]);
        // Already sorted descending, as build_once produces.
        let r = ranked(&[
            ("AUSDT", 9000.0),
            ("BUSDT", 8000.0),
            ("CUSDT", 7000.0),
            ("DUSDT", 6000.0),
        ]);

        let active = select_active(&c, &t, &r);
        // auto_top_n = 3 caps the auto leg.
        assert_eq!(active, vec!["AUSDT", "BUSDT", "CUSDT"]);
    }

    #[test]
    fn hybrid_whitelist_priority_merge() {
        let mut c = cfg(SymbolMode::HybridPriority);
        c.whitelist = vec!["WWWUSDT".into()];
        let t = tradable(&["WWWUSDT", "AUSDT", "BUSDT"]);
        let r = ranked(&[("AUSDT", 9000.0), ("BUSDT", 8000.0)]);

        let active = select_active(&c, &t, &r);
        assert_eq!(active, vec!["WWWUSDT", "AUSDT", "BUSDT"]);
    }

    #[test]
    fn hybrid_without_priority_appends_whitelist() {
        let mut c = cfg(SymbolMode::HybridPriority);
        c.whitelist_priority = false;
        c.whitelist = vec!["WWWUSDT".into()];
        let t = tradable(&["WWWUSDT", "AUSDT"]);
        let r = ranked(&[("AUSDT", 9000.0)]);

        let active = select_active(&c, &t, &r);
        assert_eq!(active, vec!["AUSDT", "WWWUSDT"]);
    }

    #[test]
    fn volume_floor_spares_whitelist_members() {
        let mut c = cfg(SymbolMode::HybridPriority);
        c.whitelist = vec!["TINYUSDT".into()];
        let t = tradable(&["TINYUSDT", "AUSDT"]);
        let r = ranked(&[("AUSDT", 9000.0), ("TINYUSDT", 10.0)]);

        let active = select_active(&c, &t, &r);
        assert!(active.contains(&"TINYUSDT".to_string()));
    }

    #[test]
    fn volume_floor_drops_thin_auto_candidates() {
        let c = cfg(SymbolMode::AutoOnly);
        let t = tradable(&["AUSDT", "THINUSDT"]);
        let r = ranked(&[("AUSDT", 9000.0), ("THINUSDT", 10.0)]);

        let active = select_active(&c, &t, &r);
        assert_eq!(active, vec!["AUSDT"]);
    }

    #[test]
    fn auto_only_ignores_whitelist_merge() {
        let mut c = cfg(SymbolMode::AutoOnly);
        c.whitelist = vec!["WWWUSDT".into()];
        let t = tradable(&["WWWUSDT", "AUSDT"]);
        let r = ranked(&[("AUSDT", 9000.0)]);

        let active = select_active(&c, &t, &r);
        assert_eq!(active, vec!["AUSDT"]);
    }

    #[test]
    fn dedupe_preserves_first_occurrence() {
        let mut c = cfg(SymbolMode::HybridPriority);
        c.whitelist = vec!["AUSDT".into()];
        let t = tradable(&["AUSDT", "BUSDT"]);
        let r = ranked(&[("AUSDT", 9000.0), ("BUSDT", 8000.0)]);

        let active = select_active(&c, &t, &r);
        assert_eq!(active, vec!["AUSDT", "BUSDT"]);
    }

    #[test]
    fn truncates_to_target() {
        let mut c = cfg(SymbolMode::AutoOnly);
        c.target_symbols = 2;
        c.auto_top_n = 10;
        let t = tradable(&["AUSDT", "BUSDT", "CUSDT"]);
        let r = ranked(&[
            ("AUSDT", 9000.0),
            ("BUSDT", 8000.0),
            ("CUSDT", 7000.0),
        ]);

        let active = select_active(&c, &t, &r);
        assert_eq!(active.len(), 2);
    }
}
