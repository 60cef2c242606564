// =============================================================================
// Binance USDⓈ-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers.
//
// Demo mode swaps the base URL for the futures testnet; nothing else changes,
// so callers cannot distinguish the two through the adapter contract.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::types::{Candle, Side};

use super::retry::RetryPolicy;
use super::{CloseResult, ExchangeAdapter, ExchangeError, ExchangePosition, OrderFill};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Per-request deadline. No adapter call may outlive this.
const REQUEST_TIMEOUT_SECS: u64 = 10;

const LIVE_BASE_URL: &str = "https://fapi.binance.com";
const DEMO_BASE_URL: &str = "https://testnet.binancefuture.com";

/// Binance futures REST client implementing [`ExchangeAdapter`].
#[derive(Clone)]
pub struct FuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl FuturesClient {
    /// Create a new client. `demo` routes every request to the futures
    /// testnet.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, demo: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if demo { DEMO_BASE_URL } else { LIVE_BASE_URL };
        debug!(base_url, demo, "futures client initialised");

        Self {
            secret,
            base_url: base_url.to_string(),
            client,
            retry: RetryPolicy::default(),
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

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport (single attempt; callers wrap with the retry policy)
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("{path}: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("{path}: bad response body: {e}")))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_error(status, &body))
        }
    }

    async fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        let query = self.signed_query(params);
        self.request(method, path, &query).await
    }

    /// Quote asset for a symbol — determines which balance row applies.
    fn quote_asset(symbol: &str) -> &str {
        for quote in ["USDT", "USDC", "BUSD"] {
            if symbol.ends_with(quote) {
                return quote;
            }
        }
        "USDT"
    }

    /// Set the symbol's leverage. Best-effort: a failure is logged but does
    /// not abort the order (the venue keeps its previous setting).
    async fn ensure_leverage(&self, symbol: &str, leverage: u32) {
        let params = format!("symbol={symbol}&leverage={leverage}");
        if let Err(e) = self
            .signed(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await
        {
            warn!(symbol, leverage, error = %e, "failed to set leverage");
        }
    }

    /// Sum the realized PnL of the fills belonging to `order_id`.
    async fn realized_pnl_for_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<f64, ExchangeError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v1/userTrades", &params)
            .await?;

        let trades = body.as_array().cloned().unwrap_or_default();
        let pnl = trades
            .iter()
            .filter_map(|t| t["realizedPnl"].as_str().and_then(|s| s.parse::<f64>().ok()))
            .sum();
        Ok(pnl)
    }
}

// =============================================================================
// Error classification
// =============================================================================

/// Map a non-2xx response onto the adapter error taxonomy using the venue's
/// error code where present and the HTTP status otherwise.
fn classify_error(status: StatusCode, body: &serde_json::Value) -> ExchangeError {
    let code = body["code"].as_i64().unwrap_or(0);
    let message = body["msg"]
        .as_str()
        .unwrap_or("no error message")
        .to_string();

    match code {
        -1121 => return ExchangeError::SymbolNotFound(message),
        -2019 => return ExchangeError::InsufficientMargin(message),
        -1013 | -1111 | -4164 => return ExchangeError::SizeInvalid(message),
        -2011 | -2013 => return ExchangeError::NotFound(message),
        -1022 | -2014 | -2015 => return ExchangeError::Auth(message),
        _ => {}
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ExchangeError::Auth(message)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.as_u16() == 418
        || status.is_server_error()
    {
        ExchangeError::Transient(format!("HTTP {status}: {message}"))
    } else if code != 0 {
        ExchangeError::Rejected { code, message }
    } else {
        ExchangeError::Transient(format!("HTTP {status}: {message}"))
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64, ExchangeError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| ExchangeError::Transient(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(ExchangeError::Transient(format!(
            "expected string or number, got: {val}"
        )))
    }
}

// =============================================================================
// Adapter implementation
// =============================================================================

#[async_trait]
impl ExchangeAdapter for FuturesClient {
    /// GET /fapi/v1/klines (public).
    ///
    /// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
    /// [5] volume — the remainder of each entry is ignored.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let query = format!("symbol={symbol}&interval={timeframe}&limit={limit}");
        let body = self
            .retry
            .run("get_candles", || {
                self.request(reqwest::Method::GET, "/fapi/v1/klines", &query)
            })
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Transient("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            candles.push(Candle::new(
                arr[0].as_i64().unwrap_or(0),
                parse_str_f64(&arr[1])?,
                parse_str_f64(&arr[2])?,
                parse_str_f64(&arr[3])?,
                parse_str_f64(&arr[4])?,
                parse_str_f64(&arr[5])?,
            ));
        }

        debug!(symbol, timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /fapi/v1/ticker/price (public).
    async fn get_ticker(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let query = format!("symbol={symbol}");
        let body = self
            .retry
            .run("get_ticker", || {
                self.request(reqwest::Method::GET, "/fapi/v1/ticker/price", &query)
            })
            .await?;

        let price = parse_str_f64(&body["price"])?;
        if price <= 0.0 {
            return Err(ExchangeError::Transient(format!(
                "non-positive ticker price for {symbol}"
            )));
        }
        Ok(price)
    }

    /// GET /fapi/v2/balance (signed) — available balance of the quote asset.
    async fn get_balance(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let body = self
            .retry
            .run("get_balance", || {
                self.signed(reqwest::Method::GET, "/fapi/v2/balance", "")
            })
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Transient("balance response is not an array".into()))?;

        let quote = Self::quote_asset(symbol);
        for row in rows {
            if row["asset"].as_str() == Some(quote) {
                let available = parse_str_f64(&row["availableBalance"])?;
                debug!(asset = quote, available, "balance retrieved");
                return Ok(available.max(0.0));
            }
        }

        warn!(asset = quote, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }

    /// GET /fapi/v2/positionRisk (signed).
    ///
    /// In hedge mode the venue reports one aggregate row per position side;
    /// each non-flat row becomes one [`ExchangePosition`] keyed by its
    /// position side.
    async fn get_positions(&self, symbol: &str) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let params = format!("symbol={symbol}");
        let body = self
            .retry
            .run("get_positions", || {
                self.signed(reqwest::Method::GET, "/fapi/v2/positionRisk", &params)
            })
            .await?;

        let rows = body.as_array().cloned().unwrap_or_default();
        let mut positions = Vec::new();

        for row in &rows {
            let amt = parse_str_f64(&row["positionAmt"]).unwrap_or(0.0);
            if amt == 0.0 {
                continue;
            }

            let side = match row["positionSide"].as_str() {
                Some("LONG") => Side::Long,
                Some("SHORT") => Side::Short,
                // One-way mode: the sign of the amount carries the side.
                _ if amt > 0.0 => Side::Long,
                _ => Side::Short,
            };

            positions.push(ExchangePosition {
                id: format!("{symbol}-{side}"),
                side,
                avg_entry: parse_str_f64(&row["entryPrice"]).unwrap_or(0.0),
                qty: amt.abs(),
            });
        }

        debug!(symbol, count = positions.len(), "positions fetched");
        Ok(positions)
    }

    /// POST /fapi/v1/order (signed) — market order opening a hedged position.
    async fn open_position(
        &self,
        symbol: &str,
        side: Side,
        lot: f64,
        leverage: u32,
    ) -> Result<OrderFill, ExchangeError> {
        self.ensure_leverage(symbol, leverage).await;

        let (order_side, position_side) = match side {
            Side::Long => ("BUY", "LONG"),
            Side::Short => ("SELL", "SHORT"),
        };
        let params = format!(
            "symbol={symbol}&side={order_side}&positionSide={position_side}\
             &type=MARKET&quantity={lot}&newOrderRespType=RESULT"
        );

        // Orders are not retried: a timeout after the venue accepted the
        // order would double the exposure. The next position sync reconciles.
        let body = self
            .signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        let order_id = body["orderId"].as_u64().unwrap_or(0);
        let filled_price = parse_str_f64(&body["avgPrice"]).unwrap_or(0.0);

        debug!(symbol, %side, lot, order_id, filled_price, "position opened");
        Ok(OrderFill {
            order_id: order_id.to_string(),
            filled_price,
        })
    }

    /// Close an aggregate position side with an opposite market order, then
    /// sum the realized PnL of the resulting fills.
    async fn close_position(
        &self,
        symbol: &str,
        position_id: &str,
    ) -> Result<CloseResult, ExchangeError> {
        // Position ids minted by `get_positions` are "{symbol}-{side}".
        let side = if position_id.ends_with("LONG") {
            Side::Long
        } else if position_id.ends_with("SHORT") {
            Side::Short
        } else {
            return Err(ExchangeError::NotFound(position_id.to_string()));
        };

        let open = self.get_positions(symbol).await?;
        let target = open
            .iter()
            .find(|p| p.side == side)
            .ok_or_else(|| ExchangeError::NotFound(position_id.to_string()))?;

        let (order_side, position_side) = match side {
            Side::Long => ("SELL", "LONG"),
            Side::Short => ("BUY", "SHORT"),
        };
        let params = format!(
            "symbol={symbol}&side={order_side}&positionSide={position_side}\
             &type=MARKET&quantity={}&newOrderRespType=RESULT",
            target.qty
        );

        let body = self
            .signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        let order_id = body["orderId"].as_u64().unwrap_or(0);
        let realized_pnl = self
            .realized_pnl_for_order(symbol, order_id)
            .await
            .unwrap_or_else(|e| {
                warn!(symbol, order_id, error = %e, "failed to fetch realized pnl for close");
                0.0
            });

        debug!(symbol, position_id, order_id, realized_pnl, "position closed");
        Ok(CloseResult { realized_pnl })
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // Binance's published signature example.
        let client = FuturesClient::new(
            "key",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
            true,
        );
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn demo_flag_selects_testnet() {
        let live = FuturesClient::new("k", "s", false);
        let demo = FuturesClient::new("k", "s", true);
        assert_eq!(live.base_url, LIVE_BASE_URL);
        assert_eq!(demo.base_url, DEMO_BASE_URL);
    }

    #[test]
    fn quote_asset_detection() {
        assert_eq!(FuturesClient::quote_asset("BTCUSDT"), "USDT");
        assert_eq!(FuturesClient::quote_asset("ETHUSDC"), "USDC");
        assert_eq!(FuturesClient::quote_asset("XRPBUSD"), "BUSD");
        assert_eq!(FuturesClient::quote_asset("WEIRD"), "USDT");
    }

    #[test]
    fn classify_margin_and_size_codes() {
        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient."});
        assert!(matches!(
            classify_error(StatusCode::BAD_REQUEST, &body),
            ExchangeError::InsufficientMargin(_)
        ));

        let body = serde_json::json!({"code": -4164, "msg": "Order's notional must be no smaller"});
        assert!(matches!(
            classify_error(StatusCode::BAD_REQUEST, &body),
            ExchangeError::SizeInvalid(_)
        ));
    }

    #[test]
    fn classify_auth_by_code_and_status() {
        let body = serde_json::json!({"code": -2015, "msg": "Invalid API-key"});
        assert!(classify_error(StatusCode::BAD_REQUEST, &body).is_auth());

        let body = serde_json::json!({"msg": "Forbidden"});
        assert!(classify_error(StatusCode::FORBIDDEN, &body).is_auth());
    }

    #[test]
    fn classify_rate_limit_and_server_errors_as_transient() {
        let body = serde_json::json!({"msg": "Too many requests"});
        assert!(classify_error(StatusCode::TOO_MANY_REQUESTS, &body).is_retryable());
        assert!(classify_error(StatusCode::BAD_GATEWAY, &body).is_retryable());
    }

    #[test]
    fn classify_unknown_code_as_rejection() {
        let body = serde_json::json!({"code": -9999, "msg": "weird"});
        assert!(matches!(
            classify_error(StatusCode::BAD_REQUEST, &body),
            ExchangeError::Rejected { code: -9999, .. }
        ));
    }

    #[test]
    fn parse_str_f64_accepts_both_encodings() {
        assert_eq!(parse_str_f64(&serde_json::json!("1.5")).unwrap(), 1.5);
        assert_eq!(parse_str_f64(&serde_json::json!(2.5)).unwrap(), 2.5);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let client = FuturesClient::new("key", "super-secret", false);
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("super-secret"));
    }
}
