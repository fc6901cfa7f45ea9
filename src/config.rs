// =============================================================================
// Configuration — engine tunables with serde defaults and env overrides
// =============================================================================
//
// Every tunable lives here. The file is plain JSON; all fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file. API credentials are never read from the JSON file — they come
// from the environment (`STRIDE_API_KEY` / `STRIDE_API_SECRET`), so a config
// committed to disk holds no secrets.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Modes
// =============================================================================

/// Wire variant used by the trade stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsMode {
    /// Pick COMBINED when `ws_base` carries a `/stream` path, SUBSCRIBE otherwise.
    Auto,
    /// `<ws_base>/stream?streams=sym@trade/...` with `{stream, data}` envelopes.
    Combined,
    /// `<ws_base>/ws` plus an initial SUBSCRIBE frame; flat payloads follow.
    Subscribe,
}

impl Default for WsMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// How the active symbol universe is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolMode {
    /// Whitelist ∩ tradable − blacklist, nothing else.
    WhitelistOnly,
    /// Volume-ranked auto candidates merged with the whitelist.
    HybridPriority,
    /// Volume-ranked auto candidates only.
    AutoOnly,
}

impl Default for SymbolMode {
    fn default() -> Self {
        Self::HybridPriority
    }
}

impl std::fmt::Display for SymbolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WhitelistOnly => write!(f, "WHITELIST_ONLY"),
            Self::HybridPriority => write!(f, "HYBRID_PRIORITY"),
            Self::AutoOnly => write!(f, "AUTO_ONLY"),
        }
    }
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_rest_base() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_base() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_quote() -> String {
    "USDT".to_string()
}

fn default_auto_top_n() -> usize {
    40
}

fn default_target_symbols() -> usize {
    20
}

fn default_refresh_universe_sec() -> u64 {
    900
}

fn default_min_24h_quote_vol() -> f64 {
    3_000_000.0
}

fn default_impulse_lookback_sec() -> u64 {
    10
}

fn default_breakout_buffer_pct() -> f64 {
    0.10
}

fn default_max_spread_pct() -> f64 {
    0.10
}

fn default_min_atr_pct() -> f64 {
    0.03
}

fn default_tf_sec() -> u64 {
    60
}

fn default_lookback_minutes() -> u64 {
    20
}

fn default_atr_period() -> usize {
    14
}

fn default_true() -> bool {
    true
}

fn default_paper_log_path() -> String {
    "data/paper_trades.csv".to_string()
}

fn default_trade_notional_usd() -> f64 {
    50.0
}

fn default_max_holding_sec() -> u64 {
    600
}

fn default_tp_pct() -> f64 {
    0.6
}

fn default_sl_pct() -> f64 {
    0.2
}

fn default_loss_streak_to_arm() -> u32 {
    2
}

fn default_live_log_path() -> String {
    "data/live_trades.csv".to_string()
}

fn default_live_notional_usd() -> f64 {
    5.0
}

fn default_live_leverage() -> u32 {
    2
}

fn default_live_max_positions() -> usize {
    1
}

fn default_max_deviation_pct() -> f64 {
    0.5
}

fn default_watch_poll_sec() -> u64 {
    3
}

fn default_watch_profit_timeout_sec() -> u64 {
    600
}

fn default_watch_hard_timeout_sec() -> u64 {
    1800
}

fn default_live_close_retries() -> u32 {
    3
}

fn default_live_close_retry_sleep_sec() -> u64 {
    2
}

fn default_live_reconcile_every_sec() -> u64 {
    30
}

fn default_heartbeat_min_sec() -> u64 {
    30
}

fn default_heartbeat_max_sec() -> u64 {
    60
}

fn default_ws_stale_sec() -> u64 {
    30
}

fn default_ws_stale_hits_to_reconnect() -> u32 {
    2
}

// =============================================================================
// Config
// =============================================================================

/// Top-level configuration for the Stride engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // --- Endpoints -----------------------------------------------------------
    #[serde(default = "default_rest_base")]
    pub rest_base: String,

    #[serde(default = "default_ws_base")]
    pub ws_base: String,

    #[serde(default)]
    pub ws_mode: WsMode,

    // --- Universe selection --------------------------------------------------
    #[serde(default)]
    pub symbol_mode: SymbolMode,

    /// Symbols always considered, regardless of liquidity ranking.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Symbols never traded.
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Symbols removed from the universe like the blacklist, kept separate so
    /// operators can distinguish "never trade" from "temporarily skip".
    #[serde(default)]
    pub skip_symbols: Vec<String>,

    /// Quote asset suffix every tradable symbol must end with.
    #[serde(default = "default_quote")]
    pub quote: String,

    /// Whitelist symbols come first in the HYBRID_PRIORITY merge.
    #[serde(default = "default_true")]
    pub whitelist_priority: bool,

    #[serde(default = "default_auto_top_n")]
    pub auto_top_n: usize,

    #[serde(default = "default_target_symbols")]
    pub target_symbols: usize,

    #[serde(default = "default_refresh_universe_sec")]
    pub refresh_universe_sec: u64,

    #[serde(default = "default_min_24h_quote_vol")]
    pub min_24h_quote_vol: f64,

    // --- Signal parameters ---------------------------------------------------
    #[serde(default = "default_impulse_lookback_sec")]
    pub impulse_lookback_sec: u64,

    #[serde(default = "default_breakout_buffer_pct")]
    pub breakout_buffer_pct: f64,

    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,

    #[serde(default = "default_min_atr_pct")]
    pub min_atr_pct: f64,

    #[serde(default = "default_tf_sec")]
    pub tf_sec: u64,

    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: u64,

    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    // --- Paper behaviour -----------------------------------------------------
    #[serde(default = "default_true")]
    pub paper_enabled: bool,

    #[serde(default = "default_paper_log_path")]
    pub paper_log_path: String,

    #[serde(default = "default_trade_notional_usd")]
    pub trade_notional_usd: f64,

    #[serde(default = "default_max_holding_sec")]
    pub max_holding_sec: u64,

    /// 0 = unlimited.
    #[serde(default)]
    pub max_trades_per_hour: u32,

    /// 0 = no cooldown.
    #[serde(default)]
    pub cooldown_after_trade_sec: u64,

    #[serde(default = "default_tp_pct")]
    pub tp_pct: f64,

    #[serde(default = "default_sl_pct")]
    pub sl_pct: f64,

    /// Consecutive paper losses on one symbol that arm the live trigger.
    #[serde(default = "default_loss_streak_to_arm")]
    pub loss_streak_to_arm: u32,

    // --- Live sizing / gates -------------------------------------------------
    #[serde(default)]
    pub live_enabled: bool,

    #[serde(default = "default_live_log_path")]
    pub live_log_path: String,

    #[serde(default = "default_live_notional_usd")]
    pub live_notional_usd: f64,

    #[serde(default = "default_live_leverage")]
    pub live_leverage: u32,

    #[serde(default = "default_live_max_positions")]
    pub live_max_positions: usize,

    /// Refuse a live entry when last trade price deviates from book mid by
    /// more than this percent. 0 disables the guard.
    #[serde(default = "default_max_deviation_pct")]
    pub max_deviation_pct: f64,

    // --- Watch deadlines -----------------------------------------------------
    #[serde(default = "default_watch_poll_sec")]
    pub watch_poll_sec: u64,

    #[serde(default = "default_watch_profit_timeout_sec")]
    pub watch_profit_timeout_sec: u64,

    #[serde(default = "default_watch_hard_timeout_sec")]
    pub watch_hard_timeout_sec: u64,

    #[serde(default)]
    pub emergency_close_on_hard_timeout: bool,

    // --- Close retry discipline ----------------------------------------------
    #[serde(default = "default_live_close_retries")]
    pub live_close_retries: u32,

    #[serde(default = "default_live_close_retry_sleep_sec")]
    pub live_close_retry_sleep_sec: u64,

    #[serde(default = "default_live_reconcile_every_sec")]
    pub live_reconcile_every_sec: u64,

    // --- Supervision ---------------------------------------------------------
    #[serde(default = "default_heartbeat_min_sec")]
    pub heartbeat_min_sec: u64,

    #[serde(default = "default_heartbeat_max_sec")]
    pub heartbeat_max_sec: u64,

    #[serde(default = "default_ws_stale_sec")]
    pub ws_stale_sec: u64,

    #[serde(default = "default_ws_stale_hits_to_reconnect")]
    pub ws_stale_hits_to_reconnect: u32,

    // --- Authentication (environment only, never serialised) -----------------
    #[serde(skip)]
    pub api_key: String,

    #[serde(skip)]
    pub api_secret: String,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialise from defaults")
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`, then apply environment
    /// overrides. A missing file is an error so the caller can fall back to
    /// defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.apply_env_overrides();

        info!(
            path = %path.display(),
            symbol_mode = %config.symbol_mode,
            live_enabled = config.live_enabled,
            "config loaded"
        );

        Ok(config)
    }

    /// Pull credentials and symbol-list overrides from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("STRIDE_API_KEY") {
            self.api_key = key;
        }
        if let Ok(secret) = std::env::var("STRIDE_API_SECRET") {
            self.api_secret = secret;
        }
        if let Ok(wl) = std::env::var("STRIDE_WHITELIST") {
            self.whitelist = split_symbols(&wl);
        }
        if let Ok(bl) = std::env::var("STRIDE_BLACKLIST") {
            self.blacklist = split_symbols(&bl);
        }
        // Symbol lists in the file may be lowercase; normalise once here.
        self.whitelist = self.whitelist.iter().map(|s| s.trim().to_uppercase()).collect();
        self.blacklist = self.blacklist.iter().map(|s| s.trim().to_uppercase()).collect();
        self.skip_symbols = self
            .skip_symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .collect();
        self.quote = self.quote.trim().to_uppercase();
    }

    /// Reject configurations the engine cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.live_enabled && (self.api_key.is_empty() || self.api_secret.is_empty()) {
            anyhow::bail!("live_enabled requires STRIDE_API_KEY and STRIDE_API_SECRET");
        }
        if self.tf_sec == 0 {
            anyhow::bail!("tf_sec must be positive");
        }
        if self.atr_period == 0 {
            anyhow::bail!("atr_period must be positive");
        }
        if self.tp_pct <= 0.0 || self.sl_pct <= 0.0 {
            anyhow::bail!("tp_pct and sl_pct must be positive");
        }
        if self.loss_streak_to_arm == 0 {
            anyhow::bail!("loss_streak_to_arm must be positive");
        }
        if self.heartbeat_min_sec > self.heartbeat_max_sec {
            anyhow::bail!("heartbeat_min_sec must not exceed heartbeat_max_sec");
        }
        if self.live_max_positions != 1 {
            anyhow::bail!("live_max_positions other than 1 is not supported");
        }
        Ok(())
    }

    /// Bars the ring buffer must retain to satisfy the ATR lookback.
    pub fn bar_capacity(&self) -> usize {
        let lookback_bars =
            (self.lookback_minutes * 60).div_ceil(self.tf_sec) as usize + 10;
        lookback_bars.max(200)
    }
}

fn split_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.symbol_mode, SymbolMode::HybridPriority);
        assert_eq!(cfg.ws_mode, WsMode::Auto);
        assert_eq!(cfg.tf_sec, 60);
        assert_eq!(cfg.atr_period, 14);
        assert_eq!(cfg.target_symbols, 20);
        assert_eq!(cfg.loss_streak_to_arm, 2);
        assert_eq!(cfg.live_max_positions, 1);
        assert!(!cfg.live_enabled);
        assert!(cfg.paper_enabled);
        assert!((cfg.tp_pct - 0.6).abs() < f64::EPSILON);
        assert!((cfg.sl_pct - 0.2).abs() < f64::EPSILON);
        assert_eq!(cfg.max_trades_per_hour, 0);
        assert_eq!(cfg.cooldown_after_trade_sec, 0);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol_mode": "WHITELIST_ONLY", "whitelist": ["btcusdt"], "tf_sec": 30 }"#;
        let mut cfg: Config = serde_json::from_str(json).unwrap();
        cfg.apply_env_overrides();
        assert_eq!(cfg.symbol_mode, SymbolMode::WhitelistOnly);
        assert_eq!(cfg.whitelist, vec!["BTCUSDT"]);
        assert_eq!(cfg.tf_sec, 30);
        assert_eq!(cfg.atr_period, 14);
    }

    #[test]
    fn bar_capacity_floor() {
        let cfg = Config::default();
        // 20 min of 60 s bars + 10 slack = 30, below the 200 floor.
        assert_eq!(cfg.bar_capacity(), 200);

        let mut big = Config::default();
        big.lookback_minutes = 300;
        big.tf_sec = 60;
        assert_eq!(big.bar_capacity(), 310);
    }

    #[test]
    fn validate_rejects_live_without_credentials() {
        let mut cfg = Config::default();
        cfg.live_enabled = true;
        cfg.api_key.clear();
        cfg.api_secret.clear();
        assert!(cfg.validate().is_err());

        cfg.api_key = "k".into();
        cfg.api_secret = "s".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_streak_and_bad_heartbeat() {
        let mut cfg = Config::default();
        cfg.loss_streak_to_arm = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.heartbeat_min_sec = 90;
        cfg.heartbeat_max_sec = 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn credentials_never_serialised() {
        let mut cfg = Config::default();
        cfg.api_key = "key".into();
        cfg.api_secret = "secret".into();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("api_key"));
    }
}
