// =============================================================================
// Depth WebSocket stream — top-20 order book into the market cache
// =============================================================================
//
// Uses the `@depth20@100ms` partial stream: full top-20 snapshots, so there
// is no diff bookkeeping. Last writer wins on the cache key; freshness
// dominates for depth data.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::cache::{MarketCache, StreamMessage, PRICE_STREAM_CHANNEL};
use crate::market_data::parse_str_f64;

/// Connect to the Binance partial-depth stream for one symbol and feed
/// snapshots into the cache. Returns on disconnect so the caller can
/// reconnect with backoff.
pub async fn run_depth_stream(symbol: &str, cache: &Arc<MarketCache>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@depth20@100ms");
    info!(url = %url, symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_depth_message(&text) {
                        Ok((bids, asks)) => {
                            cache.set_order_book(symbol, &bids, &asks);

                            if let (Some(bid), Some(ask)) = (bids.first(), asks.first()) {
                                cache.publish(
                                    PRICE_STREAM_CHANNEL,
                                    &StreamMessage::Orderbook {
                                        symbol: symbol.to_string(),
                                        best_bid: bid.0.to_string(),
                                        best_ask: ask.0.to_string(),
                                        timestamp: chrono::Utc::now().timestamp_millis(),
                                    },
                                );
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse depth message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol, error = %e, "depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, "depth WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance partial-depth message into (bids, asks) ladders.
///
/// Expected shape:
/// ```json
/// {
///   "lastUpdateId": 12345,
///   "bids": [["37000.00", "1.5"], ...],
///   "asks": [["37001.00", "1.2"], ...]
/// }
/// ```
#[allow(clippy::type_complexity)]
fn parse_depth_message(text: &str) -> Result<(Vec<(f64, f64)>, Vec<(f64, f64)>)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let parse_side = |name: &str| -> Result<Vec<(f64, f64)>> {
        let levels = root[name]
            .as_array()
            .with_context(|| format!("missing field {name}"))?;
        let mut out = Vec::with_capacity(levels.len());
        for level in levels {
            let Some(pair) = level.as_array() else {
                continue;
            };
            if pair.len() < 2 {
                continue;
            }
            let price = parse_str_f64(&pair[0], "depth.price")?;
            let qty = parse_str_f64(&pair[1], "depth.qty")?;
            out.push((price, qty));
        }
        Ok(out)
    };

    Ok((parse_side("bids")?, parse_side("asks")?))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_depth_snapshot() {
        let json = r#"{
            "lastUpdateId": 160,
            "bids": [["0.0024", "14.70"], ["0.0023", "6.40"]],
            "asks": [["0.0026", "3.60"], ["0.0027", "12.00"]]
        }"#;
        let (bids, asks) = parse_depth_message(json).expect("should parse");
        assert_eq!(bids.len(), 2);
        assert_eq!(asks.len(), 2);
        assert!((bids[0].0 - 0.0024).abs() < 1e-12);
        assert!((asks[1].1 - 12.0).abs() < 1e-12);
    }

    #[test]
    fn parse_depth_rejects_malformed() {
        assert!(parse_depth_message(r#"{"bids": []}"#).is_err());
        assert!(parse_depth_message("{}").is_err());
    }
}
