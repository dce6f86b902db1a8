// =============================================================================
// Binance REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and Binance servers.
//
// Error taxonomy:
//   - Network failures and 5xx / 418 / 429 responses are transient: GETs
//     retry with exponential backoff up to a capped attempt count.
//   - Other 4xx responses are rejections: surfaced immediately with the
//     exchange body attached.
//   - Order placement is never retried automatically (not idempotent).
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::market_data::{parse_str_f64, Candle};
use crate::types::{OrderType, Side};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum attempts for idempotent (GET) requests.
const MAX_ATTEMPTS: u32 = 4;
/// Base delay for the exponential retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

const MAINNET_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";

// =============================================================================
// Typed responses
// =============================================================================

/// Trading rules for a symbol, extracted from the exchangeInfo filters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// LOT_SIZE.minQty
    pub min_qty: f64,
    /// LOT_SIZE.maxQty
    pub max_qty: f64,
    /// LOT_SIZE.stepSize — quantity granularity.
    pub step_size: f64,
    /// PRICE_FILTER.tickSize — price granularity.
    pub tick_size: f64,
    /// MIN_NOTIONAL.minNotional (or NOTIONAL.minNotional on newer payloads).
    pub min_notional: f64,
}

/// Order-book ladder: (price, quantity) pairs, best level first.
#[derive(Debug, Clone)]
pub struct OrderBookDepth {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub last_update_id: u64,
}

// =============================================================================
// Rounding helpers (pure)
// =============================================================================

/// Number of decimal places implied by a step/tick size, e.g. 0.001 -> 3.
fn step_decimals(step: f64) -> u32 {
    if step <= 0.0 {
        return 8;
    }
    let mut decimals = 0u32;
    let mut value = step;
    while value.fract().abs() > 1e-9 && decimals < 8 {
        value *= 10.0;
        decimals += 1;
    }
    decimals
}

/// Round `value` DOWN to the precision implied by `step`.
/// Used for quantities: the exchange rejects anything finer than stepSize,
/// and rounding up would risk exceeding the sized amount.
pub fn round_down_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = (value / step + 1e-9).floor();
    snap(steps * step, step)
}

/// Round `value` to the NEAREST tick.
pub fn round_to_tick(value: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return value;
    }
    let ticks = (value / tick).round();
    snap(ticks * tick, tick)
}

/// Snap a product of step arithmetic back onto the step's decimal grid,
/// killing the float noise from the multiplication.
fn snap(value: f64, step: f64) -> f64 {
    let factor = 10f64.powi(step_decimals(step) as i32);
    (value * factor).round() / factor
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 418
}

// =============================================================================
// Client
// =============================================================================

/// Binance REST API client with HMAC-SHA256 request signing.
pub struct BinanceClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limits: RateLimitTracker,
    /// Symbol filters change rarely; cached per symbol for the UTC day.
    symbol_info_cache: RwLock<HashMap<String, (NaiveDate, SymbolInfo)>>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    /// * `testnet` — route requests to the spot testnet.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints; it rides
        // on the client so it never appears in query strings or logs.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL }.to_string();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Self {
            secret,
            base_url,
            client,
            rate_limits: RateLimitTracker::new(),
            symbol_info_cache: RwLock::new(HashMap::new()),
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
    // Transport with retry
    // -------------------------------------------------------------------------

    /// GET a JSON payload, retrying transient failures with exponential
    /// backoff. Non-transient 4xx responses bail immediately with the body.
    async fn get_json(&self, url: &str, what: &str) -> Result<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            // Cheap quota guard: wait out the window instead of burning a 429.
            if !self.rate_limits.can_send_request(1) {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            match self.client.get(url).send().await {
                Ok(resp) => {
                    self.rate_limits.update_from_headers(resp.headers());
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json()
                            .await
                            .with_context(|| format!("failed to parse {what} response"));
                    }

                    let body = resp.text().await.unwrap_or_default();
                    if is_transient_status(status) && attempt < MAX_ATTEMPTS {
                        let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                        warn!(
                            what,
                            %status,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transient exchange error — retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    anyhow::bail!("Binance {what} returned {status}: {body}");
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(
                        what,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "network error — retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("{what} request failed"));
                }
            }
        }
    }

    /// Send a non-idempotent signed request (POST / DELETE) exactly once.
    async fn send_mutation(
        &self,
        method: reqwest::Method,
        url: &str,
        what: &str,
    ) -> Result<serde_json::Value> {
        let resp = self
            .client
            .request(method, url)
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;

        self.rate_limits.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance {what} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Account / balance
    // -------------------------------------------------------------------------

    /// GET /api/v3/account (signed).
    #[instrument(skip(self), name = "binance::get_account")]
    pub async fn get_account(&self) -> Result<serde_json::Value> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);
        self.get_json(&url, "GET /api/v3/account").await
    }

    /// Free balance for a single `asset` (0.0 when absent).
    #[instrument(skip(self), name = "binance::get_balance")]
    pub async fn get_balance(&self, asset: &str) -> Result<f64> {
        let account = self.get_account().await?;

        let balances = account["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;

        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                let free: f64 = b["free"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                debug!(asset, free, "balance retrieved");
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/price — last traded price.
    #[instrument(skip(self), name = "binance::get_ticker_price")]
    pub async fn get_ticker_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let body = self.get_json(&url, "GET /api/v3/ticker/price").await?;
        parse_str_f64(&body["price"], "price")
    }

    /// GET /api/v3/depth — order-book ladders for slippage analysis.
    #[instrument(skip(self), name = "binance::get_order_book_depth")]
    pub async fn get_order_book_depth(&self, symbol: &str, limit: u32) -> Result<OrderBookDepth> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url, symbol, limit
        );
        let body = self.get_json(&url, "GET /api/v3/depth").await?;
        parse_depth(&body)
    }

    /// GET /api/v3/klines (public — no signature required).
    ///
    /// Returns candles ordered oldest -> newest, parsed from Binance's
    /// array-of-arrays response format:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let body = self.get_json(&url, "GET /api/v3/klines").await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = parse_str_f64(&arr[1], "kline.open")?;
            let high = parse_str_f64(&arr[2], "kline.high")?;
            let low = parse_str_f64(&arr[3], "kline.low")?;
            let close = parse_str_f64(&arr[4], "kline.close")?;
            let volume = parse_str_f64(&arr[5], "kline.volume")?;
            let close_time = arr[6].as_i64().unwrap_or(0);

            candles.push(Candle::new(open_time, open, high, low, close, volume, close_time));
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/exchangeInfo filtered by symbol, with the filters
    /// flattened into a [`SymbolInfo`]. Cached per symbol per UTC day.
    #[instrument(skip(self), name = "binance::get_symbol_info")]
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let today = chrono::Utc::now().date_naive();
        if let Some((cached_on, info)) = self.symbol_info_cache.read().get(symbol) {
            if *cached_on == today {
                return Ok(info.clone());
            }
        }

        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let body = self.get_json(&url, "GET /api/v3/exchangeInfo").await?;

        let entry = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("symbol not found in exchangeInfo response")?;

        let info = parse_symbol_info(entry)?;
        self.symbol_info_cache
            .write()
            .insert(symbol.to_string(), (today, info.clone()));

        debug!(symbol, "symbol info retrieved");
        Ok(info)
    }

    // -------------------------------------------------------------------------
    // Lot / tick formatting
    // -------------------------------------------------------------------------

    /// Round a quantity DOWN to the symbol's step-size precision.
    pub async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<f64> {
        let info = self.get_symbol_info(symbol).await?;
        Ok(round_down_to_step(quantity, info.step_size))
    }

    /// Round a price to the symbol's tick-size precision.
    pub async fn format_price(&self, symbol: &str, price: f64) -> Result<f64> {
        let info = self.get_symbol_info(symbol).await?;
        Ok(round_to_tick(price, info.tick_size))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v3/order (signed) — submit a new order.
    ///
    /// `price` and `time_in_force` are required for LIMIT orders; callers are
    /// expected to have formatted price/quantity to the symbol's filters.
    #[instrument(
        skip(self, price, time_in_force, stop_price, client_order_id),
        name = "binance::place_order"
    )]
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        time_in_force: Option<&str>,
        stop_price: Option<f64>,
        client_order_id: Option<&str>,
    ) -> Result<serde_json::Value> {
        let mut params = format!(
            "symbol={symbol}&side={}&type={}&quantity={quantity}",
            side.as_str(),
            order_type.as_str()
        );

        if let Some(p) = price {
            params.push_str(&format!("&price={p}"));
        }
        if let Some(tif) = time_in_force {
            params.push_str(&format!("&timeInForce={tif}"));
        }
        if let Some(sp) = stop_price {
            params.push_str(&format!("&stopPrice={sp}"));
        }
        if let Some(coid) = client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, side = %side, order_type = %order_type, quantity, "placing order");

        let body = self
            .send_mutation(reqwest::Method::POST, &url, "POST /api/v3/order")
            .await?;

        debug!(symbol, side = %side, "order placed successfully");
        Ok(body)
    }

    /// DELETE /api/v3/order (signed) — cancel an existing order.
    #[instrument(skip(self), name = "binance::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<serde_json::Value> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, order_id, "cancelling order");
        self.send_mutation(reqwest::Method::DELETE, &url, "DELETE /api/v3/order")
            .await
    }

    /// DELETE /api/v3/openOrders (signed) — cancel every open order on a
    /// symbol. Used by the circuit breaker.
    #[instrument(skip(self), name = "binance::cancel_all_orders")]
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<Vec<serde_json::Value>> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, qs);

        let body = self
            .send_mutation(reqwest::Method::DELETE, &url, "DELETE /api/v3/openOrders")
            .await?;

        let cancelled = body.as_array().cloned().unwrap_or_default();
        debug!(symbol, count = cancelled.len(), "open orders cancelled");
        Ok(cancelled)
    }

    /// GET /api/v3/order (signed) — fetch one order's current state.
    #[instrument(skip(self), name = "binance::get_order")]
    pub async fn get_order(&self, symbol: &str, order_id: &str) -> Result<serde_json::Value> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);
        self.get_json(&url, "GET /api/v3/order").await
    }

    /// GET /api/v3/openOrders (signed).
    #[instrument(skip(self), name = "binance::get_open_orders")]
    pub async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<serde_json::Value>> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, qs);

        let body = self.get_json(&url, "GET /api/v3/openOrders").await?;
        let orders = body.as_array().cloned().unwrap_or_default();
        debug!(count = orders.len(), "open orders retrieved");
        Ok(orders)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response parsing (pure, testable)
// -----------------------------------------------------------------------------

/// Parse a /api/v3/depth payload into typed ladders.
fn parse_depth(body: &serde_json::Value) -> Result<OrderBookDepth> {
    let last_update_id = body["lastUpdateId"]
        .as_u64()
        .context("depth response missing lastUpdateId")?;

    let parse_side = |side: &serde_json::Value, name: &str| -> Result<Vec<(f64, f64)>> {
        let levels = side
            .as_array()
            .with_context(|| format!("depth response missing {name}"))?;
        let mut out = Vec::with_capacity(levels.len());
        for level in levels {
            let pair = level
                .as_array()
                .with_context(|| format!("{name} level is not an array"))?;
            if pair.len() < 2 {
                continue;
            }
            let price = parse_str_f64(&pair[0], "depth.price")?;
            let qty = parse_str_f64(&pair[1], "depth.qty")?;
            out.push((price, qty));
        }
        Ok(out)
    };

    Ok(OrderBookDepth {
        bids: parse_side(&body["bids"], "bids")?,
        asks: parse_side(&body["asks"], "asks")?,
        last_update_id,
    })
}

/// Flatten an exchangeInfo symbol entry into a [`SymbolInfo`].
fn parse_symbol_info(entry: &serde_json::Value) -> Result<SymbolInfo> {
    let filters = entry["filters"]
        .as_array()
        .context("symbol entry missing filters")?;

    let find = |filter_type: &str| -> Option<&serde_json::Value> {
        filters
            .iter()
            .find(|f| f["filterType"].as_str() == Some(filter_type))
    };

    let lot_size = find("LOT_SIZE").context("LOT_SIZE filter missing")?;
    let price_filter = find("PRICE_FILTER").context("PRICE_FILTER filter missing")?;
    // Binance renamed MIN_NOTIONAL to NOTIONAL; accept either.
    let notional = find("MIN_NOTIONAL").or_else(|| find("NOTIONAL"));

    Ok(SymbolInfo {
        symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
        status: entry["status"].as_str().unwrap_or_default().to_string(),
        base_asset: entry["baseAsset"].as_str().unwrap_or_default().to_string(),
        quote_asset: entry["quoteAsset"].as_str().unwrap_or_default().to_string(),
        min_qty: parse_str_f64(&lot_size["minQty"], "minQty")?,
        max_qty: parse_str_f64(&lot_size["maxQty"], "maxQty")?,
        step_size: parse_str_f64(&lot_size["stepSize"], "stepSize")?,
        tick_size: parse_str_f64(&price_filter["tickSize"], "tickSize")?,
        min_notional: match notional {
            Some(f) => parse_str_f64(&f["minNotional"], "minNotional").unwrap_or(10.0),
            None => 10.0,
        },
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decimals_common_sizes() {
        assert_eq!(step_decimals(1.0), 0);
        assert_eq!(step_decimals(0.1), 1);
        assert_eq!(step_decimals(0.001), 3);
        assert_eq!(step_decimals(0.00000001), 8);
    }

    #[test]
    fn quantity_rounds_down_to_step() {
        assert!((round_down_to_step(75.0, 0.001) - 75.0).abs() < 1e-12);
        assert!((round_down_to_step(0.123456, 0.001) - 0.123).abs() < 1e-12);
        assert!((round_down_to_step(0.1239, 0.001) - 0.123).abs() < 1e-12);
        // Never rounds up.
        assert!(round_down_to_step(0.9999, 0.001) <= 0.9999);
    }

    #[test]
    fn price_rounds_to_nearest_tick() {
        assert!((round_to_tick(100.123, 0.01) - 100.12).abs() < 1e-12);
        assert!((round_to_tick(100.126, 0.01) - 100.13).abs() < 1e-12);
        assert!((round_to_tick(37000.4, 0.1) - 37000.4).abs() < 1e-12);
    }

    #[test]
    fn zero_step_passes_through() {
        assert_eq!(round_down_to_step(1.234, 0.0), 1.234);
        assert_eq!(round_to_tick(1.234, 0.0), 1.234);
    }

    #[test]
    fn transient_status_classification() {
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::from_u16(418).unwrap()));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn parse_depth_payload() {
        let body = serde_json::json!({
            "lastUpdateId": 12345,
            "bids": [["99.99", "1.5"], ["99.98", "2.0"]],
            "asks": [["100.00", "0.5"], ["100.50", "0.5"], ["101.00", "10.0"]]
        });
        let depth = parse_depth(&body).expect("should parse");
        assert_eq!(depth.last_update_id, 12345);
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.asks.len(), 3);
        assert!((depth.asks[0].0 - 100.0).abs() < 1e-12);
        assert!((depth.bids[0].1 - 1.5).abs() < 1e-12);
    }

    #[test]
    fn parse_symbol_info_filters() {
        let entry = serde_json::json!({
            "symbol": "BTCUSDT",
            "status": "TRADING",
            "baseAsset": "BTC",
            "quoteAsset": "USDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000", "tickSize": "0.01"},
                {"filterType": "LOT_SIZE", "minQty": "0.00001", "maxQty": "9000", "stepSize": "0.00001"},
                {"filterType": "MIN_NOTIONAL", "minNotional": "10.0"}
            ]
        });
        let info = parse_symbol_info(&entry).expect("should parse");
        assert_eq!(info.symbol, "BTCUSDT");
        assert!((info.step_size - 0.00001).abs() < 1e-15);
        assert!((info.tick_size - 0.01).abs() < 1e-12);
        assert!((info.min_notional - 10.0).abs() < 1e-12);
    }

    #[test]
    fn parse_symbol_info_new_notional_filter() {
        let entry = serde_json::json!({
            "symbol": "ETHUSDT",
            "status": "TRADING",
            "baseAsset": "ETH",
            "quoteAsset": "USDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "100000", "tickSize": "0.01"},
                {"filterType": "LOT_SIZE", "minQty": "0.0001", "maxQty": "9000", "stepSize": "0.0001"},
                {"filterType": "NOTIONAL", "minNotional": "5.0"}
            ]
        });
        let info = parse_symbol_info(&entry).expect("should parse");
        assert!((info.min_notional - 5.0).abs() < 1e-12);
    }
}
