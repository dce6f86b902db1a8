// =============================================================================
// Market-Data Cache — TTL key/value store with bounded lists and pub/sub
// =============================================================================
//
// Hot-path state for the strategy engine: last prices, top-of-book depth,
// candle histories, live signals, and the system trading status. Everything
// here is ephemeral and recoverable from the exchange; the SQLite store stays
// the source of truth for durable entities.
//
// Key layout (TTL in parentheses):
//   price:{symbol}              last price (60 s)
//   orderbook:{symbol}          top-20 bids/asks (1 s)
//   kline:{symbol}:{interval}   latest closed bar (60 s)
//   klines:{symbol}:{interval}  head-inserted bounded history (no TTL)
//   ema:{symbol}:{period}       last EMA value (60 s)
//   signal:{symbol}             last valid signal (300 s, deleted on execution)
//   system:status               {status, reason, timestamp} (no TTL)
//
// Decimal fields cross the cache as strings; `f64::to_string` emits the
// shortest representation that parses back to the identical bits.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::market_data::Candle;
use crate::types::SystemStatus;

// -----------------------------------------------------------------------------
// TTLs
// -----------------------------------------------------------------------------

const PRICE_TTL: Duration = Duration::from_secs(60);
const ORDER_BOOK_TTL: Duration = Duration::from_secs(1);
const KLINE_TTL: Duration = Duration::from_secs(60);
const EMA_TTL: Duration = Duration::from_secs(60);
const SIGNAL_TTL: Duration = Duration::from_secs(300);

/// Default cap for the rolling kline history per (symbol, interval).
pub const KLINE_HISTORY_MAX: usize = 100;

/// Capacity of each pub/sub channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Fan-out channel feeding dashboard subscribers.
pub const DASHBOARD_CHANNEL: &str = "dashboard";
/// Fan-out channel carrying raw tick/orderbook updates.
pub const PRICE_STREAM_CHANNEL: &str = "price_stream";

// -----------------------------------------------------------------------------
// Wire records (decimal fields as strings)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PriceRecord {
    price: String,
    timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmaRecord {
    value: String,
    timestamp: i64,
}

/// Top-of-book snapshot with (price, quantity) ladders, capped at 20 levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
    pub timestamp: i64,
}

impl OrderBookSnapshot {
    pub fn bids(&self) -> Vec<(f64, f64)> {
        parse_ladder(&self.bids)
    }

    pub fn asks(&self) -> Vec<(f64, f64)> {
        parse_ladder(&self.asks)
    }
}

fn parse_ladder(levels: &[[String; 2]]) -> Vec<(f64, f64)> {
    levels
        .iter()
        .filter_map(|[p, q]| Some((p.parse().ok()?, q.parse().ok()?)))
        .collect()
}

/// Candle as it crosses the cache: OHLCV as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CandleRecord {
    open_time: i64,
    close_time: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    is_closed: bool,
}

impl CandleRecord {
    fn from_candle(c: &Candle) -> Self {
        Self {
            open_time: c.open_time,
            close_time: c.close_time,
            open: c.open.to_string(),
            high: c.high.to_string(),
            low: c.low.to_string(),
            close: c.close.to_string(),
            volume: c.volume.to_string(),
            is_closed: c.is_closed,
        }
    }

    fn to_candle(&self) -> Option<Candle> {
        Some(Candle {
            open_time: self.open_time,
            close_time: self.close_time,
            open: self.open.parse().ok()?,
            high: self.high.parse().ok()?,
            low: self.low.parse().ok()?,
            close: self.close.parse().ok()?,
            volume: self.volume.parse().ok()?,
            is_closed: self.is_closed,
        })
    }
}

/// The `system:status` record. No TTL — it persists until overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: SystemStatus,
    pub reason: String,
    pub timestamp: i64,
}

// -----------------------------------------------------------------------------
// Pub/sub messages
// -----------------------------------------------------------------------------

/// Messages fanned out on the `dashboard` channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DashboardMessage {
    PriceUpdate {
        symbol: String,
        price: String,
        timestamp: i64,
    },
    TradeUpdate {
        trade: serde_json::Value,
    },
    PositionUpdate {
        position: serde_json::Value,
    },
    Signal {
        signal: serde_json::Value,
    },
    RiskUpdate {
        risk: serde_json::Value,
    },
    SystemStatus {
        status: String,
        reason: String,
        timestamp: i64,
    },
    OrderFill {
        trade: serde_json::Value,
    },
}

/// Messages fanned out on the `price_stream` channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamMessage {
    Tick {
        symbol: String,
        price: String,
        timestamp: i64,
    },
    Orderbook {
        symbol: String,
        best_bid: String,
        best_ask: String,
        timestamp: i64,
    },
}

// -----------------------------------------------------------------------------
// Cache internals
// -----------------------------------------------------------------------------

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// In-process TTL-bounded key/value store with list and pub/sub support.
pub struct MarketCache {
    entries: RwLock<HashMap<String, Entry>>,
    lists: RwLock<HashMap<String, VecDeque<serde_json::Value>>>,
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn set_entry(&self, key: String, value: serde_json::Value, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.write().insert(key, entry);
    }

    /// Read a key, treating expired entries as absent and evicting them.
    fn get_entry(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(e) if !e.is_expired(now) => return Some(e.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired — evict lazily under the write lock.
        let mut entries = self.entries.write();
        if entries.get(key).map_or(false, |e| e.is_expired(now)) {
            entries.remove(key);
        }
        None
    }

    fn delete_entry(&self, key: &str) {
        self.entries.write().remove(key);
    }

    // -------------------------------------------------------------------------
    // Prices
    // -------------------------------------------------------------------------

    pub fn set_price(&self, symbol: &str, price: f64) {
        let record = PriceRecord {
            price: price.to_string(),
            timestamp: Self::now_ms(),
        };
        match serde_json::to_value(&record) {
            Ok(value) => self.set_entry(format!("price:{symbol}"), value, Some(PRICE_TTL)),
            Err(e) => warn!(symbol, error = %e, "failed to serialize price record"),
        }
    }

    pub fn get_price(&self, symbol: &str) -> Option<f64> {
        let value = self.get_entry(&format!("price:{symbol}"))?;
        let record: PriceRecord = serde_json::from_value(value).ok()?;
        record.price.parse().ok()
    }

    /// Fetch several prices at once; absent symbols are simply missing from
    /// the result.
    pub fn get_prices(&self, symbols: &[&str]) -> HashMap<String, f64> {
        symbols
            .iter()
            .filter_map(|s| self.get_price(s).map(|p| (s.to_string(), p)))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Order book
    // -------------------------------------------------------------------------

    pub fn set_order_book(&self, symbol: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) {
        let to_wire = |levels: &[(f64, f64)]| {
            levels
                .iter()
                .take(20)
                .map(|(p, q)| [p.to_string(), q.to_string()])
                .collect::<Vec<_>>()
        };
        let snapshot = OrderBookSnapshot {
            bids: to_wire(bids),
            asks: to_wire(asks),
            timestamp: Self::now_ms(),
        };
        match serde_json::to_value(&snapshot) {
            Ok(value) => self.set_entry(format!("orderbook:{symbol}"), value, Some(ORDER_BOOK_TTL)),
            Err(e) => warn!(symbol, error = %e, "failed to serialize order book"),
        }
    }

    pub fn get_order_book(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        let value = self.get_entry(&format!("orderbook:{symbol}"))?;
        serde_json::from_value(value).ok()
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    pub fn set_latest_kline(&self, symbol: &str, interval: &str, candle: &Candle) {
        let record = CandleRecord::from_candle(candle);
        match serde_json::to_value(&record) {
            Ok(value) => {
                self.set_entry(format!("kline:{symbol}:{interval}"), value, Some(KLINE_TTL))
            }
            Err(e) => warn!(symbol, interval, error = %e, "failed to serialize kline"),
        }
    }

    pub fn get_latest_kline(&self, symbol: &str, interval: &str) -> Option<Candle> {
        let value = self.get_entry(&format!("kline:{symbol}:{interval}"))?;
        let record: CandleRecord = serde_json::from_value(value).ok()?;
        record.to_candle()
    }

    /// Append a closed bar to the rolling history: push at the head, then
    /// trim to `max_length`. The append is atomic under the list write lock.
    pub fn append_kline_history(
        &self,
        symbol: &str,
        interval: &str,
        candle: &Candle,
        max_length: usize,
    ) {
        let record = match serde_json::to_value(CandleRecord::from_candle(candle)) {
            Ok(v) => v,
            Err(e) => {
                warn!(symbol, interval, error = %e, "failed to serialize history kline");
                return;
            }
        };

        let key = format!("klines:{symbol}:{interval}");
        let mut lists = self.lists.write();
        let list = lists.entry(key).or_default();
        list.push_front(record);
        list.truncate(max_length);
    }

    /// The most recent `count` bars in chronological order (oldest first,
    /// most recent last) — the shape every analyzer expects.
    pub fn get_kline_history(&self, symbol: &str, interval: &str, count: usize) -> Vec<Candle> {
        let key = format!("klines:{symbol}:{interval}");
        let lists = self.lists.read();
        let Some(list) = lists.get(&key) else {
            return Vec::new();
        };
        list.iter()
            .take(count)
            .filter_map(|v| {
                serde_json::from_value::<CandleRecord>(v.clone())
                    .ok()
                    .and_then(|r| r.to_candle())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    // -------------------------------------------------------------------------
    // EMA
    // -------------------------------------------------------------------------

    pub fn set_ema(&self, symbol: &str, period: usize, value: f64) {
        let record = EmaRecord {
            value: value.to_string(),
            timestamp: Self::now_ms(),
        };
        match serde_json::to_value(&record) {
            Ok(v) => self.set_entry(format!("ema:{symbol}:{period}"), v, Some(EMA_TTL)),
            Err(e) => warn!(symbol, period, error = %e, "failed to serialize ema record"),
        }
    }

    pub fn get_ema(&self, symbol: &str, period: usize) -> Option<f64> {
        let value = self.get_entry(&format!("ema:{symbol}:{period}"))?;
        let record: EmaRecord = serde_json::from_value(value).ok()?;
        record.value.parse().ok()
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    pub fn set_signal(&self, symbol: &str, signal: serde_json::Value) {
        self.set_entry(format!("signal:{symbol}"), signal, Some(SIGNAL_TTL));
    }

    pub fn get_signal(&self, symbol: &str) -> Option<serde_json::Value> {
        self.get_entry(&format!("signal:{symbol}"))
    }

    /// Remove a signal after the execution layer consumed it.
    pub fn clear_signal(&self, symbol: &str) {
        self.delete_entry(&format!("signal:{symbol}"));
        debug!(symbol, "cached signal cleared");
    }

    // -------------------------------------------------------------------------
    // System status
    // -------------------------------------------------------------------------

    pub fn set_system_status(&self, status: SystemStatus, reason: &str) {
        let record = StatusRecord {
            status,
            reason: reason.to_string(),
            timestamp: Self::now_ms(),
        };
        match serde_json::to_value(&record) {
            Ok(value) => self.set_entry("system:status".to_string(), value, None),
            Err(e) => warn!(error = %e, "failed to serialize system status"),
        }
    }

    pub fn get_system_status(&self) -> Option<StatusRecord> {
        let value = self.get_entry("system:status")?;
        serde_json::from_value(value).ok()
    }

    /// Cold cache (no status yet) counts as active — the durable risk state
    /// is the authority and is checked separately.
    pub fn is_trading_active(&self) -> bool {
        self.get_system_status()
            .map_or(true, |s| s.status == SystemStatus::Active)
    }

    // -------------------------------------------------------------------------
    // Pub/sub
    // -------------------------------------------------------------------------

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        if let Some(tx) = self.channels.read().get(channel) {
            return tx.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish a serializable message to a channel. Messages to channels with
    /// no subscribers are dropped silently.
    pub fn publish<T: Serialize>(&self, channel: &str, message: &T) {
        match serde_json::to_string(message) {
            Ok(json) => {
                // send() only fails when there are no receivers.
                let _ = self.sender(channel).send(json);
            }
            Err(e) => warn!(channel, error = %e, "failed to serialize pub/sub message"),
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    // -------------------------------------------------------------------------
    // Test hooks
    // -------------------------------------------------------------------------

    /// Force a key to expire immediately (test-only).
    #[cfg(test)]
    fn expire_now(&self, key: &str) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.expires_at = Some(Instant::now() - Duration::from_millis(1));
        }
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketCache")
            .field("entries", &self.entries.read().len())
            .field("lists", &self.lists.read().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(open_time: i64, close: f64) -> Candle {
        Candle::new(open_time, close, close + 1.0, close - 1.0, close, 100.0, open_time + 59_999)
    }

    #[test]
    fn price_roundtrip_is_exact() {
        let cache = MarketCache::new();
        // Values with no short decimal representation survive the string trip.
        for price in [0.1 + 0.2, 37020.123456789, 1.0e-8, 123456789.987654321] {
            cache.set_price("BTCUSDT", price);
            assert_eq!(cache.get_price("BTCUSDT"), Some(price));
        }
    }

    #[test]
    fn absent_and_expired_prices_read_as_none() {
        let cache = MarketCache::new();
        assert_eq!(cache.get_price("BTCUSDT"), None);

        cache.set_price("BTCUSDT", 100.0);
        assert!(cache.get_price("BTCUSDT").is_some());

        cache.expire_now("price:BTCUSDT");
        assert_eq!(cache.get_price("BTCUSDT"), None);
    }

    #[test]
    fn order_book_caps_at_twenty_levels() {
        let cache = MarketCache::new();
        let levels: Vec<(f64, f64)> = (0..30).map(|i| (100.0 - i as f64 * 0.1, 1.0)).collect();
        cache.set_order_book("BTCUSDT", &levels, &levels);

        let book = cache.get_order_book("BTCUSDT").unwrap();
        assert_eq!(book.bids().len(), 20);
        assert_eq!(book.asks().len(), 20);
        assert!((book.bids()[0].0 - 100.0).abs() < 1e-12);
    }

    #[test]
    fn kline_history_head_insert_and_trim() {
        let cache = MarketCache::new();
        for i in 0..5 {
            cache.append_kline_history("BTCUSDT", "1m", &sample_candle(i * 60_000, 100.0 + i as f64), 3);
        }

        let history = cache.get_kline_history("BTCUSDT", "1m", 10);
        // Trimmed to 3, chronological order, most recent last.
        assert_eq!(history.len(), 3);
        assert!((history[0].close - 102.0).abs() < 1e-12);
        assert!((history[2].close - 104.0).abs() < 1e-12);
    }

    #[test]
    fn kline_history_count_takes_newest() {
        let cache = MarketCache::new();
        for i in 0..10 {
            cache.append_kline_history("BTCUSDT", "1m", &sample_candle(i * 60_000, i as f64), 100);
        }
        let history = cache.get_kline_history("BTCUSDT", "1m", 4);
        assert_eq!(history.len(), 4);
        let closes: Vec<f64> = history.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn latest_kline_roundtrip() {
        let cache = MarketCache::new();
        let candle = sample_candle(1_700_000_000_000, 37020.123456789);
        cache.set_latest_kline("BTCUSDT", "1m", &candle);

        let loaded = cache.get_latest_kline("BTCUSDT", "1m").unwrap();
        assert_eq!(loaded.close, candle.close);
        assert_eq!(loaded.open_time, candle.open_time);
    }

    #[test]
    fn signal_lifecycle() {
        let cache = MarketCache::new();
        cache.set_signal("BTCUSDT", serde_json::json!({"action": "BUY"}));
        assert!(cache.get_signal("BTCUSDT").is_some());

        cache.clear_signal("BTCUSDT");
        assert!(cache.get_signal("BTCUSDT").is_none());
    }

    #[test]
    fn system_status_has_no_ttl_and_gates_trading() {
        let cache = MarketCache::new();
        // Cold cache: no opinion, trading allowed.
        assert!(cache.is_trading_active());

        cache.set_system_status(SystemStatus::Paused, "Daily drawdown 5.1% exceeded limit");
        let status = cache.get_system_status().unwrap();
        assert_eq!(status.status, SystemStatus::Paused);
        assert!(!cache.is_trading_active());

        cache.set_system_status(SystemStatus::Active, "");
        assert!(cache.is_trading_active());
    }

    #[tokio::test]
    async fn pubsub_fans_out_to_subscribers() {
        let cache = MarketCache::new();
        let mut rx = cache.subscribe(DASHBOARD_CHANNEL);

        cache.publish(
            DASHBOARD_CHANNEL,
            &DashboardMessage::PriceUpdate {
                symbol: "BTCUSDT".into(),
                price: "37020.5".into(),
                timestamp: 1_700_000_000_000,
            },
        );

        let raw = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["kind"], "price_update");
        assert_eq!(parsed["price"], "37020.5");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let cache = MarketCache::new();
        cache.publish(
            PRICE_STREAM_CHANNEL,
            &StreamMessage::Tick {
                symbol: "ETHUSDT".into(),
                price: "2000".into(),
                timestamp: 0,
            },
        );
    }
}
