// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// ATR measures volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR here is the plain mean of the last `period` TR values — the stop-loss
// sizing in the risk manager wants a responsive read, not Wilder smoothing.
//
// Default period: 14 (hourly bars).
// =============================================================================

use crate::market_data::Candle;

/// Compute the ATR from a slice of OHLCV candles (oldest first).
///
/// # Returns
/// `None` when:
/// - `period` is zero.
/// - There are fewer than `period + 1` candles (each TR needs a previous
///   close).
/// - The result is non-finite.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    // True Range for each consecutive pair, most recent `period` values only.
    let start = candles.len() - period - 1;
    let window = &candles[start..];

    let mut sum = 0.0;
    for i in 1..window.len() {
        let high = window[i].high;
        let low = window[i].low;
        let prev_close = window[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        sum += hl.max(hc).max(lc);
    }

    let atr = sum / period as f64;
    atr.is_finite().then_some(atr)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Build a test candle with the given OHLC values.
    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 100.0, 59_999)
    }

    #[test]
    fn atr_needs_period_plus_one_bars() {
        let bars: Vec<Candle> = (0..14).map(|_| candle(10.0, 11.0, 9.0, 10.0)).collect();
        assert!(calculate_atr(&bars, 14).is_none());
        assert!(calculate_atr(&bars, 0).is_none());
    }

    #[test]
    fn atr_constant_range() {
        // Every bar spans exactly 2.0 with no gaps: ATR == 2.0.
        let bars: Vec<Candle> = (0..15).map(|_| candle(10.0, 11.0, 9.0, 10.0)).collect();
        let atr = calculate_atr(&bars, 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-10);
    }

    #[test]
    fn atr_gap_dominates_range() {
        // Second bar gaps up: TR = |high - prevClose| = 15 - 10 = 5.
        let bars = vec![
            candle(10.0, 10.5, 9.5, 10.0),
            candle(14.5, 15.0, 14.0, 14.5),
            candle(14.5, 15.0, 14.0, 14.5),
        ];
        let atr = calculate_atr(&bars, 2).unwrap();
        // TRs: [5.0, 1.0] => mean 3.0
        assert!((atr - 3.0).abs() < 1e-10);
    }

    #[test]
    fn atr_uses_most_recent_window() {
        // Early wild bars must not leak into a window that only covers the
        // calm tail.
        let mut bars: Vec<Candle> = (0..5).map(|_| candle(10.0, 30.0, 5.0, 10.0)).collect();
        bars.extend((0..15).map(|_| candle(10.0, 11.0, 9.0, 10.0)));
        let atr = calculate_atr(&bars, 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-10);
    }
}
