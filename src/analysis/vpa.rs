// =============================================================================
// Volume-Price Analysis (VPA) — single-bar pattern classifier
// =============================================================================
//
// Core reads on every bar:
//   1. Volume validates price movement (z-score vs the lookback window)
//   2. Spread shows effort (ratio vs the average spread)
//   3. Close position shows outcome (where in the range the bar closed)
//   4. The short-term trend gives context
//
// Pattern matching is strictly ordered; the first row that matches wins.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::Candle;

// -----------------------------------------------------------------------------
// Volume thresholds (standard deviations from the lookback mean)
// -----------------------------------------------------------------------------

const ULTRA_HIGH_VOLUME: f64 = 2.5;
const HIGH_VOLUME: f64 = 1.5;
const LOW_VOLUME: f64 = -0.5;
const ULTRA_LOW_VOLUME: f64 = -1.5;

// Spread thresholds (ratio to average spread).
const WIDE_SPREAD: f64 = 1.5;
const NARROW_SPREAD: f64 = 0.5;

// Close-position thresholds within the bar's range.
const UPPER_THIRD: f64 = 0.67;
const LOWER_THIRD: f64 = 0.33;

/// Normalized slope (% of price per bar) beyond which the short-term trend
/// is considered directional.
const TREND_SLOPE_THRESHOLD: f64 = 0.05;

/// Minimum strength for a pattern to be tradeable.
const MIN_SIGNAL_STRENGTH: f64 = 0.5;

// -----------------------------------------------------------------------------
// Types
// -----------------------------------------------------------------------------

/// VPA candlestick patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpaPattern {
    /// Ultra-high volume, wide spread into strength — potential top.
    ClimaxHigh,
    /// Ultra-high volume selling climax — potential bottom.
    ClimaxLow,
    /// Low-volume up bar — buying has dried up.
    NoDemand,
    /// Low-volume down bar — selling has dried up.
    NoSupply,
    /// High volume absorbed into a narrow spread.
    StoppingVolume,
    /// Very low volume probing a level.
    Test,
    /// Wide spread up bar closing weak — failed breakout.
    Upthrust,
    /// Wide spread down bar closing strong — failed breakdown.
    Spring,
    /// High volume with little price movement.
    EffortVsResult,
    Neutral,
}

impl VpaPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClimaxHigh => "CLIMAX_HIGH",
            Self::ClimaxLow => "CLIMAX_LOW",
            Self::NoDemand => "NO_DEMAND",
            Self::NoSupply => "NO_SUPPLY",
            Self::StoppingVolume => "STOPPING_VOLUME",
            Self::Test => "TEST",
            Self::Upthrust => "UPTHRUST",
            Self::Spring => "SPRING",
            Self::EffortVsResult => "EFFORT_VS_RESULT",
            Self::Neutral => "NEUTRAL",
        }
    }

    fn weight(self) -> f64 {
        match self {
            Self::ClimaxHigh | Self::ClimaxLow => 0.9,
            Self::Upthrust | Self::Spring => 0.85,
            Self::StoppingVolume => 0.8,
            Self::NoDemand | Self::NoSupply => 0.7,
            Self::EffortVsResult => 0.65,
            Self::Test => 0.6,
            Self::Neutral => 0.0,
        }
    }
}

impl std::fmt::Display for VpaPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Short-term market direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl TrendDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
            Self::Neutral => "NEUTRAL",
        }
    }
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full VPA read of the most recent bar.
#[derive(Debug, Clone, Serialize)]
pub struct VpaSignal {
    pub pattern: VpaPattern,
    pub direction: TrendDirection,
    /// 0.0 to 1.0.
    pub strength: f64,
    pub description: String,
    /// Volume z-score vs the lookback window.
    pub volume_anomaly: f64,
    /// Current spread over average spread.
    pub spread_ratio: f64,
    /// Close location in the bar's range, 0 (low) to 1 (high).
    pub close_position: f64,
    pub is_valid: bool,
}

impl VpaSignal {
    fn neutral(description: impl Into<String>) -> Self {
        Self {
            pattern: VpaPattern::Neutral,
            direction: TrendDirection::Neutral,
            strength: 0.0,
            description: description.into(),
            volume_anomaly: 0.0,
            spread_ratio: 1.0,
            close_position: 0.5,
            is_valid: false,
        }
    }
}

// -----------------------------------------------------------------------------
// Analyzer
// -----------------------------------------------------------------------------

/// Classifies the most recent bar against its lookback window.
#[derive(Debug, Clone)]
pub struct VpaAnalyzer {
    lookback: usize,
}

impl VpaAnalyzer {
    /// `lookback` — bars used for the volume/spread baselines (default 20).
    pub fn new(lookback: usize) -> Self {
        Self { lookback }
    }

    /// Analyze an ordered candle sequence, most recent last. Needs at least
    /// `lookback + 1` bars (the current bar is excluded from the baselines).
    pub fn analyze(&self, candles: &[Candle]) -> VpaSignal {
        if candles.len() < self.lookback + 1 {
            return VpaSignal::neutral("Insufficient data for VPA analysis");
        }

        let current = &candles[candles.len() - 1];
        let start = candles.len() - 1 - self.lookback;
        let historical = &candles[start..candles.len() - 1];

        let volume_anomaly = volume_z_score(current, historical);
        let spread_ratio = spread_ratio(current, historical);
        let close_position = current.close_position();
        let is_bullish = current.is_bullish();
        let trend = detect_trend(historical);

        let pattern = identify_pattern(
            volume_anomaly,
            spread_ratio,
            close_position,
            is_bullish,
            trend,
        );
        let strength = calculate_strength(pattern, volume_anomaly);
        let direction = signal_direction(pattern, trend);
        let description =
            describe(pattern, volume_anomaly, spread_ratio, close_position);
        let is_valid = is_valid_signal(pattern, strength, trend);

        debug!(
            pattern = %pattern,
            direction = %direction,
            strength,
            volume_anomaly,
            spread_ratio,
            close_position,
            trend = %trend,
            valid = is_valid,
            "VPA bar classified"
        );

        VpaSignal {
            pattern,
            direction,
            strength,
            description,
            volume_anomaly,
            spread_ratio,
            close_position,
            is_valid,
        }
    }
}

impl Default for VpaAnalyzer {
    fn default() -> Self {
        Self::new(20)
    }
}

// -----------------------------------------------------------------------------
// Metric helpers
// -----------------------------------------------------------------------------

/// Volume z-score of the current bar vs the historical window.
/// Zero when the window is degenerate (fewer than 2 bars or flat volume).
fn volume_z_score(current: &Candle, historical: &[Candle]) -> f64 {
    if historical.len() < 2 {
        return 0.0;
    }

    let volumes: Vec<f64> = historical.iter().map(|c| c.volume).collect();
    let mean = volumes.iter().sum::<f64>() / volumes.len() as f64;
    let variance =
        volumes.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / volumes.len() as f64;
    let std = variance.sqrt();

    if std == 0.0 {
        return 0.0;
    }
    (current.volume - mean) / std
}

/// Current spread over the average historical spread (1.0 when degenerate).
fn spread_ratio(current: &Candle, historical: &[Candle]) -> f64 {
    if historical.is_empty() {
        return 1.0;
    }
    let avg = historical.iter().map(Candle::spread).sum::<f64>() / historical.len() as f64;
    if avg == 0.0 {
        return 1.0;
    }
    current.spread() / avg
}

/// Least-squares slope of the last 5 closes, normalized by the mean price
/// and expressed as a percentage per bar.
fn detect_trend(candles: &[Candle]) -> TrendDirection {
    if candles.len() < 5 {
        return TrendDirection::Neutral;
    }

    let closes: Vec<f64> = candles[candles.len() - 5..].iter().map(|c| c.close).collect();
    let n = closes.len() as f64;

    let x_mean = (n - 1.0) / 2.0;
    let y_mean = closes.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in closes.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (y - y_mean);
        denominator += dx * dx;
    }
    if denominator == 0.0 || y_mean == 0.0 {
        return TrendDirection::Neutral;
    }

    let slope = numerator / denominator;
    let normalized = (slope / y_mean) * 100.0;

    if normalized > TREND_SLOPE_THRESHOLD {
        TrendDirection::Bullish
    } else if normalized < -TREND_SLOPE_THRESHOLD {
        TrendDirection::Bearish
    } else {
        TrendDirection::Neutral
    }
}

// -----------------------------------------------------------------------------
// Classification
// -----------------------------------------------------------------------------

/// Ordered pattern table — the first matching row wins.
fn identify_pattern(
    volume: f64,
    spread: f64,
    close_position: f64,
    is_bullish: bool,
    trend: TrendDirection,
) -> VpaPattern {
    // Climax bars: ultra-high volume on a wide spread into the trend.
    if volume >= ULTRA_HIGH_VOLUME && spread >= WIDE_SPREAD {
        if is_bullish && trend == TrendDirection::Bullish {
            return VpaPattern::ClimaxHigh;
        }
        if !is_bullish && trend == TrendDirection::Bearish {
            return VpaPattern::ClimaxLow;
        }
    }

    // Stopping volume: high volume absorbed into a narrow spread.
    if volume >= HIGH_VOLUME && spread <= NARROW_SPREAD {
        return VpaPattern::StoppingVolume;
    }

    // Effort vs result: high volume, minimal movement.
    if volume >= HIGH_VOLUME && spread < 0.75 {
        return VpaPattern::EffortVsResult;
    }

    // No demand: low-volume up bar closing firm.
    if volume <= LOW_VOLUME && is_bullish && close_position >= UPPER_THIRD {
        return VpaPattern::NoDemand;
    }

    // No supply: low-volume down bar closing weak.
    if volume <= LOW_VOLUME && !is_bullish && close_position <= LOWER_THIRD {
        return VpaPattern::NoSupply;
    }

    // Test: very low volume probing a level.
    if volume <= ULTRA_LOW_VOLUME {
        return VpaPattern::Test;
    }

    // Upthrust: wide up bar closing in the lower third.
    if spread >= WIDE_SPREAD && is_bullish && close_position <= LOWER_THIRD && volume >= 0.0 {
        return VpaPattern::Upthrust;
    }

    // Spring: wide down bar closing in the upper third.
    if spread >= WIDE_SPREAD && !is_bullish && close_position >= UPPER_THIRD && volume >= 0.0 {
        return VpaPattern::Spring;
    }

    VpaPattern::Neutral
}

/// Strength = pattern weight scaled by volume significance, clamped to [0, 1].
fn calculate_strength(pattern: VpaPattern, volume_anomaly: f64) -> f64 {
    if pattern == VpaPattern::Neutral {
        return 0.0;
    }
    let volume_factor = (volume_anomaly.abs() / 3.0).min(1.0);
    (pattern.weight() * (0.7 + 0.3 * volume_factor)).clamp(0.0, 1.0)
}

/// Trading direction implied by the pattern.
fn signal_direction(pattern: VpaPattern, trend: TrendDirection) -> TrendDirection {
    match pattern {
        // Selling exhaustion, dried-up supply, failed breakdown.
        VpaPattern::ClimaxLow | VpaPattern::NoSupply | VpaPattern::Spring => {
            TrendDirection::Bullish
        }
        // Buying exhaustion, dried-up demand, failed breakout.
        VpaPattern::ClimaxHigh | VpaPattern::NoDemand | VpaPattern::Upthrust => {
            TrendDirection::Bearish
        }
        // Stopping volume precedes a reversal of the current trend.
        VpaPattern::StoppingVolume => match trend {
            TrendDirection::Bullish => TrendDirection::Bearish,
            _ => TrendDirection::Bullish,
        },
        // A successful test confirms the trend.
        VpaPattern::Test => trend,
        _ => TrendDirection::Neutral,
    }
}

/// Validity gate: pattern present, strong enough, and not fading into a
/// trend that contradicts it.
fn is_valid_signal(pattern: VpaPattern, strength: f64, trend: TrendDirection) -> bool {
    if pattern == VpaPattern::Neutral || strength < MIN_SIGNAL_STRENGTH {
        return false;
    }

    match pattern {
        // Reversal patterns stand on their own.
        VpaPattern::ClimaxHigh
        | VpaPattern::ClimaxLow
        | VpaPattern::Upthrust
        | VpaPattern::Spring
        | VpaPattern::StoppingVolume => true,
        // No-demand fades longs: rejected only against a strong uptrend.
        VpaPattern::NoDemand => trend != TrendDirection::Bullish,
        // No-supply fades shorts: rejected only against a strong downtrend.
        VpaPattern::NoSupply => trend != TrendDirection::Bearish,
        _ => true,
    }
}

fn describe(pattern: VpaPattern, volume: f64, spread: f64, close_position: f64) -> String {
    let vol_desc = if volume >= ULTRA_HIGH_VOLUME {
        "ultra high"
    } else if volume >= HIGH_VOLUME {
        "high"
    } else if volume >= LOW_VOLUME {
        "average"
    } else if volume >= ULTRA_LOW_VOLUME {
        "low"
    } else {
        "very low"
    };

    let spread_desc = if spread >= WIDE_SPREAD {
        "wide"
    } else if spread <= NARROW_SPREAD {
        "narrow"
    } else {
        "average"
    };

    let close_desc = if close_position >= UPPER_THIRD {
        "upper"
    } else if close_position <= LOWER_THIRD {
        "lower"
    } else {
        "middle"
    };

    match pattern {
        VpaPattern::ClimaxHigh => format!(
            "Buying climax detected - {vol_desc} volume with {spread_desc} spread, potential reversal"
        ),
        VpaPattern::ClimaxLow => format!(
            "Selling climax detected - {vol_desc} volume with {spread_desc} spread, potential bottom"
        ),
        VpaPattern::NoDemand => format!(
            "No Demand - {vol_desc} volume up bar closing in {close_desc} third, weak buying"
        ),
        VpaPattern::NoSupply => {
            format!("No Supply - {vol_desc} volume down bar, selling drying up")
        }
        VpaPattern::StoppingVolume => {
            format!("Stopping Volume - {vol_desc} volume absorbed with {spread_desc} spread")
        }
        VpaPattern::Test => format!("Test bar - {vol_desc} volume testing price level"),
        VpaPattern::Upthrust => {
            format!("Upthrust - {spread_desc} spread up bar closing weak, bearish")
        }
        VpaPattern::Spring => {
            format!("Spring - {spread_desc} spread down bar closing strong, bullish")
        }
        VpaPattern::EffortVsResult => {
            format!("Effort vs Result mismatch - {vol_desc} volume but minimal movement")
        }
        VpaPattern::Neutral => "No significant VPA pattern detected".to_string(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Doji bar with a chosen close, spread, and volume.
    fn history_bar(close: f64, spread: f64, volume: f64) -> Candle {
        Candle::new(0, close, close + spread / 2.0, close - spread / 2.0, close, volume, 0)
    }

    /// 20 history bars: flat tail then five monotonically decreasing closes,
    /// constant spread 4/9, volumes alternating 90/110 (mean 100, std 10).
    fn bearish_history() -> Vec<Candle> {
        let spread = 4.0 / 9.0;
        let mut bars = Vec::new();
        for i in 0..15 {
            let volume = if i % 2 == 0 { 90.0 } else { 110.0 };
            bars.push(history_bar(101.5, spread, volume));
        }
        for (i, close) in [101.5, 101.0, 100.5, 100.0, 99.5].iter().enumerate() {
            let volume = if (15 + i) % 2 == 0 { 90.0 } else { 110.0 };
            bars.push(history_bar(*close, spread, volume));
        }
        bars
    }

    #[test]
    fn insufficient_data_is_neutral() {
        let analyzer = VpaAnalyzer::new(20);
        let bars: Vec<Candle> = (0..20).map(|_| history_bar(100.0, 1.0, 100.0)).collect();
        let signal = analyzer.analyze(&bars);
        assert_eq!(signal.pattern, VpaPattern::Neutral);
        assert!(!signal.is_valid);
        assert!((signal.close_position - 0.5).abs() < 1e-12);
        assert!((signal.spread_ratio - 1.0).abs() < 1e-12);
    }

    #[test]
    fn selling_climax_near_hundred() {
        // 21 bars priced near 100. The current bar: volume z-score 3.1,
        // spread ratio 1.8, bearish body closing at 0.125 of its range,
        // into a falling 5-bar trend.
        let analyzer = VpaAnalyzer::new(20);
        let mut bars = bearish_history();
        bars.push(Candle::new(0, 99.8, 99.9, 99.1, 99.2, 131.0, 0));

        let signal = analyzer.analyze(&bars);

        assert!((signal.volume_anomaly - 3.1).abs() < 1e-9);
        assert!((signal.spread_ratio - 1.8).abs() < 1e-9);
        assert!((signal.close_position - 0.125).abs() < 1e-9);
        assert_eq!(signal.pattern, VpaPattern::ClimaxLow);
        assert_eq!(signal.direction, TrendDirection::Bullish);
        // strength = 0.9 * (0.7 + 0.3 * min(3.1/3, 1)) = 0.90
        assert!((signal.strength - 0.9).abs() < 1e-9);
        assert!(signal.is_valid);
    }

    #[test]
    fn flat_volume_history_never_triggers_volume_patterns() {
        // stddev = 0 => z-score pinned to 0, so no volume-gated pattern fires
        // even with an enormous current volume.
        let analyzer = VpaAnalyzer::new(20);
        let mut bars: Vec<Candle> = (0..20).map(|_| history_bar(100.0, 1.0, 100.0)).collect();
        bars.push(Candle::new(0, 100.0, 100.5, 99.5, 100.2, 10_000.0, 0));

        let signal = analyzer.analyze(&bars);
        assert_eq!(signal.volume_anomaly, 0.0);
        assert_eq!(signal.pattern, VpaPattern::Neutral);
    }

    #[test]
    fn upthrust_wide_up_bar_closing_weak() {
        let mut bars: Vec<Candle> = (0..20)
            .map(|i| history_bar(100.0, 1.0, if i % 2 == 0 { 90.0 } else { 110.0 }))
            .collect();
        // Wide bullish bar (spread 2.0) closing in its lower third, average volume.
        bars.push(Candle::new(0, 99.95, 101.6, 99.6, 100.0, 100.0, 0));

        let analyzer = VpaAnalyzer::new(20);
        let signal = analyzer.analyze(&bars);
        assert_eq!(signal.pattern, VpaPattern::Upthrust);
        assert_eq!(signal.direction, TrendDirection::Bearish);
    }

    #[test]
    fn stopping_volume_flips_trend_direction() {
        let spread = 1.0;
        let mut bars: Vec<Candle> = Vec::new();
        for i in 0..15 {
            bars.push(history_bar(100.0, spread, if i % 2 == 0 { 90.0 } else { 110.0 }));
        }
        // Rising tail => bullish trend.
        for (i, close) in [100.0, 100.5, 101.0, 101.5, 102.0].iter().enumerate() {
            bars.push(history_bar(*close, spread, if (15 + i) % 2 == 0 { 90.0 } else { 110.0 }));
        }
        // High volume (z = 2.0), narrow spread (ratio 0.4).
        bars.push(Candle::new(0, 102.0, 102.2, 101.8, 102.1, 120.0, 0));

        let analyzer = VpaAnalyzer::new(20);
        let signal = analyzer.analyze(&bars);
        assert_eq!(signal.pattern, VpaPattern::StoppingVolume);
        assert_eq!(signal.direction, TrendDirection::Bearish);
        assert!(signal.is_valid);
    }

    #[test]
    fn no_demand_rejected_in_strong_uptrend() {
        let spread = 1.0;
        let mut bars: Vec<Candle> = Vec::new();
        for i in 0..15 {
            bars.push(history_bar(100.0, spread, if i % 2 == 0 { 90.0 } else { 110.0 }));
        }
        for (i, close) in [100.0, 100.5, 101.0, 101.5, 102.0].iter().enumerate() {
            bars.push(history_bar(*close, spread, if (15 + i) % 2 == 0 { 90.0 } else { 110.0 }));
        }
        // Low volume (z = -9.0 capped by factor), bullish bar closing firm,
        // average spread.
        bars.push(Candle::new(0, 102.0, 103.0, 101.95, 102.95, 10.0, 0));

        let analyzer = VpaAnalyzer::new(20);
        let signal = analyzer.analyze(&bars);
        assert_eq!(signal.pattern, VpaPattern::NoDemand);
        // Pattern found, but faded against a strong uptrend.
        assert!(!signal.is_valid);
    }

    #[test]
    fn strength_is_clamped() {
        for pattern in [
            VpaPattern::ClimaxHigh,
            VpaPattern::Spring,
            VpaPattern::Test,
            VpaPattern::EffortVsResult,
        ] {
            for z in [-10.0, -1.0, 0.0, 1.0, 10.0] {
                let s = calculate_strength(pattern, z);
                assert!((0.0..=1.0).contains(&s));
            }
        }
        assert_eq!(calculate_strength(VpaPattern::Neutral, 5.0), 0.0);
    }

    #[test]
    fn trend_detection_thresholds() {
        let rising: Vec<Candle> = [100.0, 100.5, 101.0, 101.5, 102.0]
            .iter()
            .map(|c| history_bar(*c, 1.0, 100.0))
            .collect();
        assert_eq!(detect_trend(&rising), TrendDirection::Bullish);

        let falling: Vec<Candle> = [102.0, 101.5, 101.0, 100.5, 100.0]
            .iter()
            .map(|c| history_bar(*c, 1.0, 100.0))
            .collect();
        assert_eq!(detect_trend(&falling), TrendDirection::Bearish);

        let flat: Vec<Candle> = (0..5).map(|_| history_bar(100.0, 1.0, 100.0)).collect();
        assert_eq!(detect_trend(&flat), TrendDirection::Neutral);

        // Fewer than 5 bars: no opinion.
        assert_eq!(detect_trend(&rising[..4]), TrendDirection::Neutral);
    }
}
