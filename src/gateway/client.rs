// =============================================================================
// Exchange REST gateway — HMAC-SHA256 signed requests against a
// Binance-Futures-compatible venue
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms; local clock
// drift against the venue is absorbed by a server-time offset refreshed via
// `sync_time`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::gateway::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;
type Result<T> = std::result::Result<T, GatewayError>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Per-call request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 20;

// ---------------------------------------------------------------------------
// Typed results
// ---------------------------------------------------------------------------

/// Order-size and price constraints for one symbol, from exchangeInfo filters.
/// Kept as decimals so step/tick quantization is exact.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
}

/// One row of the 24 h ticker list.
#[derive(Debug, Clone)]
pub struct Ticker24h {
    pub symbol: String,
    pub quote_volume: f64,
}

/// Best bid/ask snapshot.
#[derive(Debug, Clone, Copy)]
pub struct BookTicker {
    pub bid: f64,
    pub ask: f64,
}

impl BookTicker {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Spread as a percent of mid, or `None` when the book is empty.
    pub fn spread_pct(&self) -> Option<f64> {
        let mid = self.mid();
        if mid <= 0.0 {
            return None;
        }
        Some((self.ask - self.bid).abs() / mid * 100.0)
    }
}

/// Acknowledgement returned by order placement and order-status queries.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub status: String,
    pub avg_price: Option<f64>,
    pub executed_qty: Option<f64>,
}

/// One open order row, as much of it as the core needs.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: i64,
    pub order_type: String,
    pub side: String,
}

/// Authoritative remote position state.
#[derive(Debug, Clone)]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: f64,
}

/// One account fill from the userTrades endpoint.
#[derive(Debug, Clone)]
pub struct UserTrade {
    pub order_id: i64,
    pub side: String,
    pub price: f64,
    pub qty: f64,
    pub commission: f64,
    pub commission_asset: String,
    pub realized_pnl: f64,
    pub time: i64,
}

/// Conditional close order flavours used for bracket legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalKind {
    StopMarket,
    TakeProfitMarket,
}

impl ConditionalKind {
    pub fn as_order_type(&self) -> &'static str {
        match self {
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// REST gateway with HMAC-SHA256 request signing and server-time absorption.
pub struct ExchangeGateway {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// serverTime − localTime, milliseconds. Applied to every signed timestamp.
    time_offset_ms: AtomicI64,
}

impl ExchangeGateway {
    /// Create a new gateway.
    ///
    /// # Arguments
    /// * `base_url` — REST base, e.g. `https://fapi.binance.com`.
    /// * `api_key`  — sent as a header, never in query params.
    /// * `secret`   — used exclusively for HMAC signing.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            time_offset_ms: AtomicI64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Local UNIX timestamp in milliseconds.
    fn local_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64
    }

    /// Signed timestamp: local clock shifted by the last known server offset.
    fn timestamp_ms(&self) -> i64 {
        Self::local_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Build the full query string for a signed request: the caller's params
    /// in insertion order, then timestamp, recvWindow, and the signature.
    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> Result<serde_json::Value> {
        let url = if signed {
            format!("{}{}?{}", self.base_url, path, self.signed_query(params))
        } else if params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, params)
        };

        let resp = self.client.request(method, &url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            warn!(path, %status, body = %body, "HTTP ERROR");
            return Err(GatewayError::from_status(status, &body));
        }

        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| GatewayError::Parse(format!("{path}: {e}")))
    }

    // -------------------------------------------------------------------------
    // Time sync
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/time.
    pub async fn server_time(&self) -> Result<i64> {
        let body = self
            .request_json(Method::GET, "/fapi/v1/time", "", false)
            .await?;
        body["serverTime"]
            .as_i64()
            .ok_or_else(|| GatewayError::Parse("missing serverTime".into()))
    }

    /// Refresh the signed-timestamp offset from the venue clock.
    #[instrument(skip(self), name = "gateway::sync_time")]
    pub async fn sync_time(&self) -> Result<()> {
        let server = self.server_time().await?;
        let offset = server - Self::local_ms();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "server time offset updated");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo — per-symbol order filters for every
    /// tradable perpetual (status TRADING, contractType PERPETUAL; absent
    /// fields count as tradable).
    #[instrument(skip(self), name = "gateway::exchange_info")]
    pub async fn exchange_info(&self) -> Result<HashMap<String, SymbolFilters>> {
        let body = self
            .request_json(Method::GET, "/fapi/v1/exchangeInfo", "", false)
            .await?;

        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| GatewayError::Parse("exchangeInfo missing symbols".into()))?;

        let mut out = HashMap::with_capacity(symbols.len());
        for s in symbols {
            let status = s["status"].as_str().unwrap_or("TRADING");
            if status != "TRADING" {
                continue;
            }
            let contract = s["contractType"].as_str().unwrap_or("PERPETUAL");
            if !contract.is_empty() && contract != "PERPETUAL" {
                continue;
            }
            let Some(sym) = s["symbol"].as_str() else {
                continue;
            };
            match parse_filters(s) {
                Ok(filters) => {
                    out.insert(sym.to_uppercase(), filters);
                }
                Err(e) => {
                    warn!(symbol = sym, error = %e, "skipping symbol with unparsable filters");
                }
            }
        }

        debug!(count = out.len(), "exchangeInfo fetched");
        Ok(out)
    }

    /// GET /fapi/v1/ticker/24hr (no symbol → full list).
    #[instrument(skip(self), name = "gateway::tickers_24h")]
    pub async fn tickers_24h(&self) -> Result<Vec<Ticker24h>> {
        let body = self
            .request_json(Method::GET, "/fapi/v1/ticker/24hr", "", false)
            .await?;

        let rows = unwrap_list(&body);
        let mut out = Vec::with_capacity(rows.len());
        for t in rows {
            let Some(symbol) = t["symbol"].as_str() else {
                continue;
            };
            // Futures tickers report 24h turnover as quoteVolume; some
            // compatible venues abbreviate the key.
            let qv = ["quoteVolume", "quoteVol", "q"]
                .iter()
                .find_map(|k| parse_f64(&t[*k]).ok())
                .unwrap_or(0.0);
            out.push(Ticker24h {
                symbol: symbol.to_uppercase(),
                quote_volume: qv,
            });
        }
        Ok(out)
    }

    /// GET /fapi/v1/ticker/bookTicker for one symbol.
    pub async fn book_ticker(&self, symbol: &str) -> Result<BookTicker> {
        let params = format!("symbol={symbol}");
        let body = self
            .request_json(Method::GET, "/fapi/v1/ticker/bookTicker", &params, false)
            .await?;
        Ok(BookTicker {
            bid: parse_f64(&body["bidPrice"])?,
            ask: parse_f64(&body["askPrice"])?,
        })
    }

    /// GET /fapi/v1/ticker/price for one symbol.
    pub async fn ticker_price(&self, symbol: &str) -> Result<f64> {
        let params = format!("symbol={symbol}");
        let body = self
            .request_json(Method::GET, "/fapi/v1/ticker/price", &params, false)
            .await?;
        parse_f64(&body["price"])
    }

    // -------------------------------------------------------------------------
    // Signed account operations
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/leverage.
    #[instrument(skip(self), name = "gateway::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.request_json(Method::POST, "/fapi/v1/leverage", &params, true)
            .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    /// POST /fapi/v1/order — market order, optionally reduce-only.
    #[instrument(skip(self, qty), name = "gateway::place_market")]
    pub async fn place_market(
        &self,
        symbol: &str,
        side: &str,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let cid = format!("st-{}", Uuid::new_v4().simple());
        let mut params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={}&newClientOrderId={cid}",
            qty.normalize()
        );
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        debug!(symbol, side, qty = %qty, reduce_only, "placing market order");
        let body = self
            .request_json(Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        parse_order_ack(&body)
    }

    /// POST /fapi/v1/order — STOP_MARKET / TAKE_PROFIT_MARKET close leg,
    /// always reduce-only, with an explicit quantity.
    #[instrument(skip(self, stop_price, qty), name = "gateway::place_conditional_close")]
    pub async fn place_conditional_close(
        &self,
        symbol: &str,
        side: &str,
        kind: ConditionalKind,
        stop_price: Decimal,
        qty: Decimal,
    ) -> Result<OrderAck> {
        let cid = format!("st-{}", Uuid::new_v4().simple());
        let params = format!(
            "symbol={symbol}&side={side}&type={}&stopPrice={}&quantity={}&reduceOnly=true&newClientOrderId={cid}",
            kind.as_order_type(),
            stop_price.normalize(),
            qty.normalize()
        );

        debug!(
            symbol,
            side,
            kind = kind.as_order_type(),
            stop_price = %stop_price,
            qty = %qty,
            "placing conditional close"
        );
        let body = self
            .request_json(Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        parse_order_ack(&body)
    }

    /// DELETE /fapi/v1/allOpenOrders for one symbol.
    #[instrument(skip(self), name = "gateway::cancel_all")]
    pub async fn cancel_all(&self, symbol: &str) -> Result<()> {
        let params = format!("symbol={symbol}");
        self.request_json(Method::DELETE, "/fapi/v1/allOpenOrders", &params, true)
            .await?;
        debug!(symbol, "all open orders cancelled");
        Ok(())
    }

    /// GET /fapi/v1/openOrders for one symbol.
    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let params = format!("symbol={symbol}");
        let body = self
            .request_json(Method::GET, "/fapi/v1/openOrders", &params, true)
            .await?;

        let rows = unwrap_list(&body);
        let mut out = Vec::with_capacity(rows.len());
        for o in rows {
            let Some(order_id) = o["orderId"].as_i64() else {
                continue;
            };
            out.push(OpenOrder {
                order_id,
                order_type: o["type"].as_str().unwrap_or("").to_string(),
                side: o["side"].as_str().unwrap_or("").to_string(),
            });
        }
        Ok(out)
    }

    /// GET /fapi/v1/order — status of a single order.
    pub async fn order(&self, symbol: &str, order_id: i64) -> Result<OrderAck> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self
            .request_json(Method::GET, "/fapi/v1/order", &params, true)
            .await?;
        parse_order_ack(&body)
    }

    /// GET /fapi/v2/positionRisk, falling back to /fapi/v1 on venues that
    /// never shipped v2.
    #[instrument(skip(self), name = "gateway::position_risk")]
    pub async fn position_risk(&self, symbol: &str) -> Result<Vec<PositionRisk>> {
        let params = format!("symbol={symbol}");
        let body = match self
            .request_json(Method::GET, "/fapi/v2/positionRisk", &params, true)
            .await
        {
            Ok(body) => body,
            Err(GatewayError::NotFound(_)) | Err(GatewayError::Rejected(_)) => {
                self.request_json(Method::GET, "/fapi/v1/positionRisk", &params, true)
                    .await?
            }
            Err(e) => return Err(e),
        };

        let rows = unwrap_list(&body);
        let mut out = Vec::with_capacity(rows.len());
        for p in rows {
            let Some(sym) = p["symbol"].as_str() else {
                continue;
            };
            out.push(PositionRisk {
                symbol: sym.to_uppercase(),
                position_amt: parse_decimal(&p["positionAmt"]).unwrap_or(Decimal::ZERO),
                entry_price: parse_f64(&p["entryPrice"]).unwrap_or(0.0),
            });
        }
        Ok(out)
    }

    /// GET /fapi/v1/userTrades over a time window.
    #[instrument(skip(self, start_ms, end_ms), name = "gateway::user_trades")]
    pub async fn user_trades(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<UserTrade>> {
        let params =
            format!("symbol={symbol}&startTime={start_ms}&endTime={end_ms}&limit={limit}");
        let body = self
            .request_json(Method::GET, "/fapi/v1/userTrades", &params, true)
            .await?;

        let rows = unwrap_list(&body);
        let mut out = Vec::with_capacity(rows.len());
        for t in rows {
            let Some(order_id) = t["orderId"].as_i64() else {
                continue;
            };
            out.push(UserTrade {
                order_id,
                side: t["side"].as_str().unwrap_or("").to_string(),
                price: parse_f64(&t["price"]).unwrap_or(0.0),
                qty: parse_f64(&t["qty"]).unwrap_or(0.0),
                commission: parse_f64(&t["commission"]).unwrap_or(0.0),
                commission_asset: t["commissionAsset"].as_str().unwrap_or("").to_string(),
                realized_pnl: parse_f64(&t["realizedPnl"]).unwrap_or(0.0),
                time: t["time"].as_i64().unwrap_or(0),
            });
        }
        out.sort_by_key(|t| t.time);
        Ok(out)
    }
}

impl std::fmt::Debug for ExchangeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeGateway")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

/// Some compatible venues wrap list payloads in an envelope object.
fn unwrap_list(body: &serde_json::Value) -> Vec<serde_json::Value> {
    if let Some(arr) = body.as_array() {
        return arr.clone();
    }
    for key in ["data", "result", "rows", "items"] {
        if let Some(arr) = body[key].as_array() {
            return arr.clone();
        }
    }
    Vec::new()
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_f64(val: &serde_json::Value) -> std::result::Result<f64, GatewayError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| GatewayError::Parse(format!("bad numeric string '{s}'")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(GatewayError::Parse(format!("expected number, got {val}")))
    }
}

/// Parse a canonical decimal string (or number) without losing precision.
fn parse_decimal(val: &serde_json::Value) -> std::result::Result<Decimal, GatewayError> {
    let raw = if let Some(s) = val.as_str() {
        s.to_string()
    } else if val.is_number() {
        val.to_string()
    } else {
        return Err(GatewayError::Parse(format!("expected decimal, got {val}")));
    };
    raw.parse::<Decimal>()
        .map_err(|_| GatewayError::Parse(format!("bad decimal '{raw}'")))
}

fn parse_order_ack(body: &serde_json::Value) -> std::result::Result<OrderAck, GatewayError> {
    let order_id = body["orderId"]
        .as_i64()
        .ok_or_else(|| GatewayError::Parse("order ack missing orderId".into()))?;
    Ok(OrderAck {
        order_id,
        status: body["status"].as_str().unwrap_or("").to_string(),
        avg_price: parse_f64(&body["avgPrice"]).ok().filter(|p| *p > 0.0),
        executed_qty: parse_f64(&body["executedQty"]).ok(),
    })
}

/// Extract step/tick/min filters from one exchangeInfo symbol entry.
fn parse_filters(entry: &serde_json::Value) -> std::result::Result<SymbolFilters, GatewayError> {
    let mut step_size = Decimal::new(1, 6);
    let mut min_qty = Decimal::ZERO;
    let mut tick_size = Decimal::new(1, 6);
    let mut min_notional = Decimal::ZERO;

    if let Some(filters) = entry["filters"].as_array() {
        for f in filters {
            match f["filterType"].as_str().unwrap_or("") {
                "LOT_SIZE" => {
                    step_size = parse_decimal(&f["stepSize"]).unwrap_or(step_size);
                    min_qty = parse_decimal(&f["minQty"]).unwrap_or(min_qty);
                }
                "PRICE_FILTER" => {
                    tick_size = parse_decimal(&f["tickSize"]).unwrap_or(tick_size);
                }
                "MIN_NOTIONAL" => {
                    // Futures venues disagree on the field name.
                    min_notional = parse_decimal(&f["notional"])
                        .or_else(|_| parse_decimal(&f["minNotional"]))
                        .unwrap_or(min_notional);
                }
                _ => {}
            }
        }
    }

    Ok(SymbolFilters {
        step_size,
        min_qty,
        tick_size,
        min_notional,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_filters_from_exchange_info_entry() {
        let entry: serde_json::Value = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "status": "TRADING",
                "contractType": "PERPETUAL",
                "filters": [
                    { "filterType": "PRICE_FILTER", "tickSize": "0.10" },
                    { "filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001" },
                    { "filterType": "MIN_NOTIONAL", "notional": "5" }
                ]
            }"#,
        )
        .unwrap();

        let f = parse_filters(&entry).unwrap();
        assert_eq!(f.tick_size, "0.10".parse::<Decimal>().unwrap());
        assert_eq!(f.step_size, "0.001".parse::<Decimal>().unwrap());
        assert_eq!(f.min_qty, "0.001".parse::<Decimal>().unwrap());
        assert_eq!(f.min_notional, Decimal::from(5));
    }

    #[test]
    fn parse_f64_accepts_strings_and_numbers() {
        assert_eq!(parse_f64(&serde_json::json!("1.5")).unwrap(), 1.5);
        assert_eq!(parse_f64(&serde_json::json!(2.5)).unwrap(), 2.5);
        assert!(parse_f64(&serde_json::json!(null)).is_err());
        assert!(parse_f64(&serde_json::json!("abc")).is_err());
    }

    #[test]
    fn parse_decimal_preserves_scale() {
        let d = parse_decimal(&serde_json::json!("0.00100")).unwrap();
        assert_eq!(d, "0.001".parse::<Decimal>().unwrap());
    }

    #[test]
    fn order_ack_optional_fields() {
        let body = serde_json::json!({
            "orderId": 42,
            "status": "FILLED",
            "avgPrice": "101.5",
            "executedQty": "3"
        });
        let ack = parse_order_ack(&body).unwrap();
        assert_eq!(ack.order_id, 42);
        assert_eq!(ack.avg_price, Some(101.5));
        assert_eq!(ack.executed_qty, Some(3.0));

        // ACK without fill info (NEW status) leaves the optionals empty.
        let body = serde_json::json!({ "orderId": 7, "status": "NEW", "avgPrice": "0" });
        let ack = parse_order_ack(&body).unwrap();
        assert_eq!(ack.avg_price, None);
    }

    #[test]
    fn unwrap_list_handles_envelopes() {
        let plain = serde_json::json!([{ "a": 1 }]);
        assert_eq!(unwrap_list(&plain).len(), 1);

        let wrapped = serde_json::json!({ "data": [{ "a": 1 }, { "a": 2 }] });
        assert_eq!(unwrap_list(&wrapped).len(), 2);

        let empty = serde_json::json!({ "foo": 1 });
        assert!(unwrap_list(&empty).is_empty());
    }

    #[test]
    fn book_ticker_spread() {
        let bt = BookTicker { bid: 99.0, ask: 101.0 };
        assert_eq!(bt.mid(), 100.0);
        assert!((bt.spread_pct().unwrap() - 2.0).abs() < 1e-12);

        let empty = BookTicker { bid: 0.0, ask: 0.0 };
        assert!(empty.spread_pct().is_none());
    }
}
