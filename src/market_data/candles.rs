// =============================================================================
// OHLCV candles and their VPA-derived geometry
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A single OHLCV bar. Closed bars are immutable; the in-progress bar of a
/// stream is continuously replaced until the exchange flags it closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, epoch milliseconds.
    pub open_time: i64,
    /// Bar close time, epoch milliseconds.
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            is_closed: true,
        }
    }

    // -------------------------------------------------------------------------
    // Derived geometry
    // -------------------------------------------------------------------------

    /// Full bar range: high − low.
    pub fn spread(&self) -> f64 {
        self.high - self.low
    }

    /// Absolute body size: |open − close|.
    pub fn body(&self) -> f64 {
        (self.open - self.close).abs()
    }

    /// A bar is bullish when it closes at or above its open.
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    /// Upper wick. For a bullish bar the body top is the close, for a
    /// bearish bar it is the open.
    pub fn upper_wick(&self) -> f64 {
        if self.is_bullish() {
            self.high - self.close
        } else {
            self.high - self.open
        }
    }

    /// Lower wick, mirroring [`upper_wick`](Self::upper_wick).
    pub fn lower_wick(&self) -> f64 {
        if self.is_bullish() {
            self.open - self.low
        } else {
            self.close - self.low
        }
    }

    /// Where the close sits within the bar's range: 0.0 = at the low,
    /// 1.0 = at the high, 0.5 for a zero-range bar.
    pub fn close_position(&self) -> f64 {
        let spread = self.spread();
        if spread == 0.0 {
            return 0.5;
        }
        (self.close - self.low) / spread
    }
}

/// Composite key identifying a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
/// Binance sends numeric values as JSON strings in most payloads.
pub fn parse_str_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 100.0, 59_999)
    }

    #[test]
    fn derived_fields_bullish_bar() {
        let c = bar(10.0, 14.0, 9.0, 13.0);
        assert!(c.is_bullish());
        assert!((c.spread() - 5.0).abs() < 1e-12);
        assert!((c.body() - 3.0).abs() < 1e-12);
        assert!((c.upper_wick() - 1.0).abs() < 1e-12);
        assert!((c.lower_wick() - 1.0).abs() < 1e-12);
        assert!((c.close_position() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn derived_fields_bearish_bar() {
        let c = bar(13.0, 14.0, 9.0, 10.0);
        assert!(!c.is_bullish());
        assert!((c.upper_wick() - 1.0).abs() < 1e-12);
        assert!((c.lower_wick() - 1.0).abs() < 1e-12);
        assert!((c.close_position() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn flat_bar_close_position_is_half() {
        // high == low => spread 0 and close_position pinned to 0.5.
        let c = bar(10.0, 10.0, 10.0, 10.0);
        assert_eq!(c.spread(), 0.0);
        assert!((c.close_position() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn derived_roundtrip_consistency() {
        // Wicks plus body always reassemble the full spread.
        for c in [
            bar(10.0, 14.0, 9.0, 13.0),
            bar(13.0, 14.0, 9.0, 10.0),
            bar(10.0, 10.0, 10.0, 10.0),
        ] {
            let rebuilt = c.upper_wick() + c.body() + c.lower_wick();
            assert!((rebuilt - c.spread()).abs() < 1e-12);
        }
    }

    #[test]
    fn parse_str_f64_accepts_both_forms() {
        assert!(
            (parse_str_f64(&serde_json::json!("37020.5"), "x").unwrap() - 37020.5).abs() < 1e-12
        );
        assert!((parse_str_f64(&serde_json::json!(42.0), "x").unwrap() - 42.0).abs() < 1e-12);
        assert!(parse_str_f64(&serde_json::json!(true), "x").is_err());
    }
}
