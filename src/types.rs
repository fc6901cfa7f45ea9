// =============================================================================
// Shared types used across the Stride trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a paper or live position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position in this direction.
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Order side that closes a position in this direction.
    pub fn close_order_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Why a paper or live position was closed. `Display` renders the names that
/// appear in the CSV logs and on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// Take-profit price reached on a tick (paper) or TP bracket fill (live).
    Tp,
    /// Stop-loss price reached on a tick (paper) or SL bracket fill (live).
    Sl,
    /// Paper holding age exceeded the configured maximum.
    Timeout,
    /// Live profit-deadline fired while the position was in profit.
    TimeoutProfit,
    /// Live hard-deadline fired with emergency close enabled.
    TimeoutHard,
    /// Shutdown signal forced the live position flat.
    ForceExit,
    /// The venue reported the position flat during a watch poll.
    CloseUnknownOrStopFilled,
    /// Settlement matched the exit fill to the TP bracket order.
    TpExchange,
    /// Settlement matched the exit fill to the SL bracket order.
    SlExchange,
    Other(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tp => write!(f, "TP"),
            Self::Sl => write!(f, "SL"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::TimeoutProfit => write!(f, "TIMEOUT_PROFIT"),
            Self::TimeoutHard => write!(f, "TIMEOUT_HARD"),
            Self::ForceExit => write!(f, "FORCE_EXIT"),
            Self::CloseUnknownOrStopFilled => write!(f, "CLOSE_UNKNOWN_OR_STOP_FILLED"),
            Self::TpExchange => write!(f, "TP_EXCHANGE"),
            Self::SlExchange => write!(f, "SL_EXCHANGE"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A single trade from the market stream, already normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeTick {
    pub symbol: String,
    pub price: f64,
    pub ts_ms: i64,
}

/// Current UNIX time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current UNIX time in whole seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
