// =============================================================================
// Trade WebSocket stream — COMBINED and SUBSCRIBE wire variants
// =============================================================================
//
// One connection covers the whole active symbol set. The function returns
// instead of looping forever so that the orchestrator owns reconnection and
// backoff; a watchdog-initiated reconnect closes the socket with code 4000.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::{coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::config::WsMode;
use crate::types::{now_ms, TradeTick};

/// Why the stream loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    /// Shutdown signal observed.
    Stopped,
    /// Watchdog requested a reconnect; socket closed with 4000 "stale".
    Stale,
    /// Remote closed the stream.
    Ended,
}

/// Resolve AUTO against the configured base URL: bases that already carry a
/// `/stream` path speak the combined protocol.
fn resolve_combined(ws_base: &str, mode: WsMode) -> bool {
    match mode {
        WsMode::Combined => true,
        WsMode::Subscribe => false,
        WsMode::Auto => ws_base.contains("/stream"),
    }
}

/// Build the connection URL for the chosen wire variant.
fn build_url(ws_base: &str, combined: bool, symbols: &[String]) -> String {
    let base = ws_base.trim_end_matches('/');
    if combined {
        let streams = symbols
            .iter()
            .map(|s| format!("{}@trade", s.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");
        if let Some(prefix) = base.split_once("?streams=").map(|(p, _)| p) {
            // Base already carries the combined path, possibly with a stream list.
            format!("{prefix}?streams={streams}")
        } else if base.ends_with("/stream") {
            format!("{base}?streams={streams}")
        } else {
            format!("{base}/stream?streams={streams}")
        }
    } else {
        format!("{base}/ws")
    }
}

/// Connect, subscribe, and pump trades into `tick_tx` until the socket drops,
/// the watchdog fires, or shutdown is signalled.
pub async fn run_trade_stream(
    ws_base: &str,
    mode: WsMode,
    symbols: &[String],
    tick_tx: &mpsc::Sender<TradeTick>,
    last_msg_ms: &Arc<AtomicI64>,
    reconnect: &Arc<Notify>,
    stop: &mut watch::Receiver<bool>,
) -> Result<StreamExit> {
    let combined = resolve_combined(ws_base, mode);
    let url = build_url(ws_base, combined, symbols);
    info!(url = %url, symbols = symbols.len(), combined, "WS connecting");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    if !combined {
        let params: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@trade", s.to_lowercase()))
            .collect();
        let sub = serde_json::json!({ "method": "SUBSCRIBE", "params": params, "id": 1 });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("failed to send SUBSCRIBE frame")?;
        info!(streams = params.len(), "WS subscribed");
    }

    info!("WS connected");
    last_msg_ms.store(now_ms(), Ordering::Relaxed);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(StreamExit::Stopped);
                }
            }
            _ = reconnect.notified() => {
                warn!("WS stale — closing socket for reconnect");
                let frame = CloseFrame {
                    code: CloseCode::from(4000),
                    reason: "stale".into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                return Ok(StreamExit::Stale);
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_msg_ms.store(now_ms(), Ordering::Relaxed);
                        if let Some(tick) = parse_trade_frame(&text, now_ms()) {
                            if tick_tx.send(tick).await.is_err() {
                                // Receiver gone — the engine is shutting down.
                                return Ok(StreamExit::Stopped);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // tungstenite queues the pong reply automatically.
                        last_msg_ms.store(now_ms(), Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!(?frame, "WS closed by remote");
                        return Ok(StreamExit::Ended);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(e).context("trade WebSocket read error");
                    }
                    None => {
                        warn!("WS stream ended");
                        return Ok(StreamExit::Ended);
                    }
                }
            }
        }
    }
}

/// Parse one text frame into a trade tick.
///
/// Combined frames wrap the payload in `{ "stream": ..., "data": {...} }`;
/// SUBSCRIBE-mode frames are the flat payload. Subscription acknowledgements
/// (`{"result":null,"id":1}`) and other non-trade events yield `None`.
/// Missing trade-time fields fall back `T` → `tradeTime` → `E` → local time.
fn parse_trade_frame(text: &str, local_now_ms: i64) -> Option<TradeTick> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;

    let data = if root.get("data").map(|d| d.is_object()).unwrap_or(false) {
        &root["data"]
    } else {
        &root
    };

    // Subscription ack: has an id, no symbol.
    if data.get("id").is_some() && data.get("s").is_none() {
        return None;
    }

    let symbol = data["s"].as_str()?.to_uppercase();
    let price: f64 = match &data["p"] {
        serde_json::Value::String(s) => s.parse().ok()?,
        serde_json::Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    if price <= 0.0 {
        return None;
    }

    let ts_ms = data["T"]
        .as_i64()
        .or_else(|| data["tradeTime"].as_i64())
        .or_else(|| data["E"].as_i64())
        .unwrap_or(local_now_ms);

    Some(TradeTick { symbol, price, ts_ms })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_url_from_bare_base() {
        let url = build_url(
            "wss://fstream.example.com",
            true,
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        );
        assert_eq!(
            url,
            "wss://fstream.example.com/stream?streams=btcusdt@trade/ethusdt@trade"
        );
    }

    #[test]
    fn combined_url_from_prewired_base() {
        // Operators sometimes configure the full combined prefix directly.
        let url = build_url(
            "wss://fstream.example.com/stream?streams=",
            true,
            &["BTCUSDT".to_string()],
        );
        assert_eq!(
            url,
            "wss://fstream.example.com/stream?streams=btcusdt@trade"
        );
    }

    #[test]
    fn subscribe_url() {
        let url = build_url("wss://fstream.example.com/", false, &["BTCUSDT".to_string()]);
        assert_eq!(url, "wss://fstream.example.com/ws");
    }

    #[test]
    fn auto_mode_resolution() {
        assert!(resolve_combined(
            "wss://x.example.com/stream?streams=",
            WsMode::Auto
        ));
        assert!(!resolve_combined("wss://x.example.com", WsMode::Auto));
        assert!(resolve_combined("wss://x.example.com", WsMode::Combined));
        assert!(!resolve_combined(
            "wss://x.example.com/stream",
            WsMode::Subscribe
        ));
    }

    #[test]
    fn parse_combined_envelope() {
        let frame = r#"{ "stream": "btcusdt@trade",
                         "data": { "s": "BTCUSDT", "p": "37000.5", "T": 1700000000123 } }"#;
        let tick = parse_trade_frame(frame, 0).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.price, 37000.5);
        assert_eq!(tick.ts_ms, 1700000000123);
    }

    #[test]
    fn parse_flat_subscribe_frame() {
        let frame = r#"{ "s": "ethusdt", "p": "2000.25", "T": 42 }"#;
        let tick = parse_trade_frame(frame, 0).unwrap();
        assert_eq!(tick.symbol, "ETHUSDT");
        assert_eq!(tick.price, 2000.25);
        assert_eq!(tick.ts_ms, 42);
    }

    #[test]
    fn ack_frames_are_ignored() {
        assert!(parse_trade_frame(r#"{ "result": null, "id": 1 }"#, 0).is_none());
    }

    #[test]
    fn timestamp_fallback_chain() {
        let t1 = parse_trade_frame(r#"{ "s": "A", "p": "1", "tradeTime": 7 }"#, 99).unwrap();
        assert_eq!(t1.ts_ms, 7);

        let t2 = parse_trade_frame(r#"{ "s": "A", "p": "1", "E": 8 }"#, 99).unwrap();
        assert_eq!(t2.ts_ms, 8);

        let t3 = parse_trade_frame(r#"{ "s": "A", "p": "1" }"#, 99).unwrap();
        assert_eq!(t3.ts_ms, 99);
    }

    #[test]
    fn garbage_and_nonpositive_prices_rejected() {
        assert!(parse_trade_frame("not json", 0).is_none());
        assert!(parse_trade_frame(r#"{ "s": "A", "p": "0" }"#, 0).is_none());
        assert!(parse_trade_frame(r#"{ "e": "ping" }"#, 0).is_none());
    }
}
