// =============================================================================
// Kline WebSocket stream — feeds the market cache and the candle audit table
// =============================================================================
//
// One task per (symbol, interval). A closed candle (`k.x == true`) is the
// only trigger that appends to the rolling history; in-progress updates only
// refresh the latest-kline key and the live price. Late updates never rewrite
// bars that already entered the history.
//
// Ordering on close: durable store first, cache second.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::cache::{
    DashboardMessage, MarketCache, StreamMessage, DASHBOARD_CHANNEL, KLINE_HISTORY_MAX,
    PRICE_STREAM_CHANNEL,
};
use crate::market_data::{parse_str_f64, Candle, CandleKey};
use crate::store::Store;

/// Intervals the engine subscribes to.
pub const SUPPORTED_INTERVALS: &[&str] = &["1m", "5m", "15m", "1h"];

/// Connect to the Binance kline stream for a single (symbol, interval) pair
/// and feed updates into the cache (and, for closed bars, the store).
///
/// Runs until the stream disconnects or errors, then returns so the caller
/// can handle reconnection with its own backoff.
pub async fn run_kline_stream(
    symbol: &str,
    interval: &str,
    cache: &Arc<MarketCache>,
    store: &Arc<Store>,
) -> Result<()> {
    if !SUPPORTED_INTERVALS.contains(&interval) {
        warn!(interval, "unsupported kline interval requested — subscribing anyway");
    }

    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@kline_{interval}");
    info!(url = %url, symbol, interval, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol, interval, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_message(&text) {
                        Ok((key, candle)) => {
                            debug!(
                                key = %key,
                                close = candle.close,
                                closed = candle.is_closed,
                                "candle update"
                            );
                            apply_update(cache, store, &key, &candle);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse kline message");
                        }
                    }
                }
                // Ping / Pong / Binary / Close frames are handled (or safely
                // ignorable) at the tungstenite layer.
            }
            Some(Err(e)) => {
                error!(symbol, interval, error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, interval, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Route one candle update into cache, store, and fan-out channels.
fn apply_update(cache: &Arc<MarketCache>, store: &Arc<Store>, key: &CandleKey, candle: &Candle) {
    cache.set_latest_kline(&key.symbol, &key.interval, candle);

    // Single writer per price key: only the 1m stream owns `price:{symbol}`.
    if key.interval == "1m" {
        cache.set_price(&key.symbol, candle.close);
        let timestamp = chrono::Utc::now().timestamp_millis();
        cache.publish(
            PRICE_STREAM_CHANNEL,
            &StreamMessage::Tick {
                symbol: key.symbol.clone(),
                price: candle.close.to_string(),
                timestamp,
            },
        );
        cache.publish(
            DASHBOARD_CHANNEL,
            &DashboardMessage::PriceUpdate {
                symbol: key.symbol.clone(),
                price: candle.close.to_string(),
                timestamp,
            },
        );
    }

    if candle.is_closed {
        // Store write precedes the cache append; a failed audit write only
        // degrades durability, the hot path keeps moving.
        if let Err(e) = store.insert_candle(key, candle) {
            warn!(key = %key, error = %e, "failed to persist closed candle");
        }
        cache.append_kline_history(&key.symbol, &key.interval, candle, KLINE_HISTORY_MAX);
    }
}

/// Parse a kline message. Supports both the combined-stream envelope
/// (`{"stream": ..., "data": {...}}`) and the direct single-stream payload.
fn parse_kline_message(text: &str) -> Result<(CandleKey, Candle)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];

    let interval = k["i"].as_str().context("missing field k.i")?.to_string();
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;

    let open = parse_str_f64(&k["o"], "k.o")?;
    let high = parse_str_f64(&k["h"], "k.h")?;
    let low = parse_str_f64(&k["l"], "k.l")?;
    let close = parse_str_f64(&k["c"], "k.c")?;
    let volume = parse_str_f64(&k["v"], "k.v")?;
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    let key = CandleKey { symbol, interval };
    let candle = Candle {
        open_time,
        close_time,
        open,
        high,
        low,
        close,
        volume,
        is_closed,
    };

    Ok((key, candle))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn kline_json(is_closed: bool, close: &str) -> String {
        format!(
            r#"{{
                "e": "kline",
                "s": "BTCUSDT",
                "k": {{
                    "t": 1700000000000,
                    "T": 1700000059999,
                    "i": "1m",
                    "o": "37000.00",
                    "h": "37050.00",
                    "l": "36990.00",
                    "c": "{close}",
                    "v": "123.456",
                    "x": {is_closed}
                }}
            }}"#
        )
    }

    #[test]
    fn parse_single_stream_message() {
        let (key, candle) = parse_kline_message(&kline_json(false, "37020.00")).unwrap();
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.interval, "1m");
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert!(!candle.is_closed);
    }

    #[test]
    fn parse_combined_stream_envelope() {
        let wrapped = format!(
            r#"{{"stream": "btcusdt@kline_1m", "data": {}}}"#,
            kline_json(true, "37021.00")
        );
        let (key, candle) = parse_kline_message(&wrapped).unwrap();
        assert_eq!(key.symbol, "BTCUSDT");
        assert!(candle.is_closed);
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(parse_kline_message(r#"{"e": "kline"}"#).is_err());
        assert!(parse_kline_message("not json").is_err());
    }

    #[test]
    fn closed_candle_enters_history_and_store() {
        let cache = Arc::new(MarketCache::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let key = CandleKey::new("BTCUSDT", "1m");

        let (_, open_bar) = parse_kline_message(&kline_json(false, "37010.00")).unwrap();
        apply_update(&cache, &store, &key, &open_bar);
        // In-progress bar: visible as latest + price, absent from history.
        assert_eq!(cache.get_kline_history("BTCUSDT", "1m", 10).len(), 0);
        assert_eq!(cache.get_price("BTCUSDT"), Some(37010.0));
        assert!(cache.get_latest_kline("BTCUSDT", "1m").is_some());

        let (_, closed_bar) = parse_kline_message(&kline_json(true, "37020.00")).unwrap();
        apply_update(&cache, &store, &key, &closed_bar);
        let history = cache.get_kline_history("BTCUSDT", "1m", 10);
        assert_eq!(history.len(), 1);
        assert!((history[0].close - 37020.0).abs() < 1e-9);
    }

    #[test]
    fn non_primary_interval_does_not_touch_price() {
        let cache = Arc::new(MarketCache::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let key = CandleKey::new("BTCUSDT", "5m");

        let (_, mut bar) = parse_kline_message(&kline_json(true, "37020.00")).unwrap();
        bar.is_closed = true;
        apply_update(&cache, &store, &key, &bar);

        assert_eq!(cache.get_price("BTCUSDT"), None);
        assert_eq!(cache.get_kline_history("BTCUSDT", "5m", 10).len(), 1);
    }
}
