// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = (close_t - EMA_{t-1}) * multiplier + EMA_{t-1}
//
// The very first EMA value is seeded with the SMA of the first `period` closes.
// =============================================================================

/// Compute the EMA series for the given `closes` slice and look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Each output element corresponds to a close starting at index `period - 1`.
///
/// # Edge cases
/// - `period == 0` => empty vec (division by zero guard)
/// - `closes.len() < period` => empty vec
/// - Non-finite intermediate values stop the series; downstream consumers
///   should not trust a broken tail.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = (close - prev_ema) * multiplier + prev_ema;
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// Latest EMA value over `closes`, if computable.
pub fn latest_ema(closes: &[f64], period: usize) -> Option<f64> {
    calculate_ema(closes, period).last().copied()
}

/// Current price deviation from the EMA as a fraction:
/// `(close - ema) / ema`. Positive when price trades above the average.
///
/// Returns `None` when the series is too short or the EMA is zero.
pub fn ema_deviation(closes: &[f64], period: usize) -> Option<f64> {
    let ema = latest_ema(closes, period)?;
    if ema == 0.0 {
        return None;
    }
    let current = *closes.last()?;
    let deviation = (current - ema) / ema;
    deviation.is_finite().then_some(deviation)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero() {
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_period_equals_length() {
        let closes = vec![2.0, 4.0, 6.0];
        let ema = calculate_ema(&closes, 3);
        assert_eq!(ema.len(), 1);
        // Should be the SMA = (2+4+6)/3 = 4.0
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA of [1,2,3,4,5,6,7,8,9,10]
        // SMA of first 5 = 3.0, multiplier = 2/6 = 1/3
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 6); // indices 4..9

        let mult = 2.0 / 6.0;
        let mut expected = 3.0; // SMA seed
        let mut expected_vec = vec![expected];
        for &c in &closes[5..] {
            expected = (c - expected) * mult + expected;
            expected_vec.push(expected);
        }
        for (a, b) in ema.iter().zip(expected_vec.iter()) {
            assert!((a - b).abs() < 1e-10, "got {a}, expected {b}");
        }
    }

    #[test]
    fn ema_handles_nan_in_input() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        let ema = calculate_ema(&closes, 3);
        // SMA of first 3 = 2.0, then next value is NaN => series stops at seed.
        assert_eq!(ema.len(), 1);
    }

    #[test]
    fn deviation_sign_matches_price_position() {
        // Rising series: last close sits above its EMA.
        let rising: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        assert!(ema_deviation(&rising, 20).unwrap() > 0.0);

        // Falling series: last close sits below its EMA.
        let falling: Vec<f64> = (1..=40).rev().map(|x| x as f64).collect();
        assert!(ema_deviation(&falling, 20).unwrap() < 0.0);

        // Flat series: deviation is zero.
        let flat = vec![100.0; 40];
        assert!(ema_deviation(&flat, 20).unwrap().abs() < 1e-12);
    }

    #[test]
    fn deviation_none_on_short_series() {
        assert!(ema_deviation(&[1.0, 2.0], 20).is_none());
    }
}
