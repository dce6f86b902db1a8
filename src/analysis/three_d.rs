// =============================================================================
// Three-Dimensional Analyzer — Relational + Fundamental + Technical confluence
// =============================================================================
//
// Each dimension votes a direction; at least two agreeing votes, a clear
// macro window, and a confluence score >= 0.6 make the signal tradeable.
//
//   Relational  — cross-asset health read from the ETH/BTC price ratio
//   Fundamental — macro calendar windows around CPI/PPI-class releases
//   Technical   — EMA(20) trend agreement across 1m/5m/15m/1h
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::indicators::ema::latest_ema;
use crate::market_data::Candle;
use crate::models::EconomicEvent;
use crate::store::Store;

// -----------------------------------------------------------------------------
// Tunables
// -----------------------------------------------------------------------------

/// Do not trade this close to a high/medium-impact release.
const PRE_EVENT_AVOID_MINUTES: i64 = 30;
/// Tradeable window after a release.
const POST_EVENT_TRADE_MINUTES: i64 = 60;

/// ETH/BTC ratio bands for the crypto-health read.
const ETH_BTC_HEALTHY: f64 = 0.06;
const ETH_BTC_WEAK: f64 = 0.04;

/// Deviation-from-forecast magnitude that counts as a surprise.
const SURPRISE_DEVIATION: f64 = 0.5;

/// Minimum confluence score for a valid signal.
const MIN_CONFLUENCE_SCORE: f64 = 0.6;

/// Events fetched per calendar window.
const EVENT_WINDOW_LIMIT: usize = 5;

/// Timeframes scanned by the technical dimension.
pub const TIMEFRAMES: &[&str] = &["1m", "5m", "15m", "1h"];

// -----------------------------------------------------------------------------
// Types
// -----------------------------------------------------------------------------

/// Directional vote of a dimension (or the combined confluence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alignment {
    Bullish,
    Bearish,
    Neutral,
    Conflicting,
}

impl Alignment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
            Self::Neutral => "NEUTRAL",
            Self::Conflicting => "CONFLICTING",
        }
    }
}

impl std::fmt::Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cross-market correlation read.
#[derive(Debug, Clone, Serialize)]
pub struct RelationalAnalysis {
    pub btc_eth_correlation: f64,
    pub crypto_health: Alignment,
    pub usd_impact: Alignment,
    /// "RISK_ON", "RISK_OFF", or "NEUTRAL".
    pub risk_sentiment: String,
    pub description: String,
}

/// Macro-event window read.
#[derive(Debug, Clone, Serialize)]
pub struct FundamentalAnalysis {
    pub upcoming_events: Vec<EconomicEvent>,
    pub recent_events: Vec<EconomicEvent>,
    pub event_impact: Alignment,
    /// Time until the next high/medium-impact release, if one is scheduled
    /// within 24 h.
    #[serde(skip)]
    pub time_to_next_event: Option<Duration>,
    pub post_event_window: bool,
    pub description: String,
}

/// Multi-timeframe EMA trend read.
#[derive(Debug, Clone, Serialize)]
pub struct TechnicalAnalysis {
    pub timeframe_trends: HashMap<String, Alignment>,
    /// Share of timeframes agreeing with the primary trend, 0.0 to 1.0.
    pub trend_alignment: f64,
    pub primary_trend: Alignment,
    /// Price deviation from the EMA per timeframe (fraction).
    pub ema_positions: HashMap<String, f64>,
    pub description: String,
}

/// Combined three-dimensional result.
#[derive(Debug, Clone, Serialize)]
pub struct ThreeDSignal {
    pub relational: RelationalAnalysis,
    pub fundamental: FundamentalAnalysis,
    pub technical: TechnicalAnalysis,
    pub confluence: Alignment,
    pub confluence_score: f64,
    pub dimensions_aligned: usize,
    pub is_valid: bool,
    pub description: String,
}

// -----------------------------------------------------------------------------
// Analyzer
// -----------------------------------------------------------------------------

pub struct ThreeDAnalyzer {
    store: Arc<Store>,
    ema_period: usize,
    ema_deviation_threshold: f64,
}

impl ThreeDAnalyzer {
    pub fn new(store: Arc<Store>, ema_period: usize, ema_deviation_threshold: f64) -> Self {
        Self {
            store,
            ema_period,
            ema_deviation_threshold,
        }
    }

    /// Perform the full 3-D analysis.
    ///
    /// * `klines_by_timeframe` — candle history per timeframe, oldest first.
    /// * `related_prices` — quote prices of related assets (BTCUSDT/ETHUSDT
    ///   at minimum for the relational dimension).
    /// * `now` — evaluation instant; injected so the event windows are
    ///   deterministic under test.
    pub fn analyze(
        &self,
        symbol: &str,
        klines_by_timeframe: &HashMap<String, Vec<Candle>>,
        related_prices: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> ThreeDSignal {
        let relational = analyze_relational(related_prices);
        let fundamental = self.analyze_fundamental(now);
        let technical = self.analyze_technical(klines_by_timeframe);

        let (confluence, confluence_score, dimensions_aligned) =
            calculate_confluence(&relational, &fundamental, &technical);

        let is_valid = is_valid_signal(confluence, confluence_score, dimensions_aligned, &fundamental);

        let description = format!(
            "3D Confluence: {confluence} | Dimensions aligned: {dimensions_aligned}/3 | \
             Relational: {} | Technical: {} ({:.0}% aligned)",
            relational.crypto_health,
            technical.primary_trend,
            technical.trend_alignment * 100.0
        );

        debug!(
            symbol,
            confluence = %confluence,
            confluence_score,
            dimensions_aligned,
            valid = is_valid,
            "3-D analysis complete"
        );

        ThreeDSignal {
            relational,
            fundamental,
            technical,
            confluence,
            confluence_score,
            dimensions_aligned,
            is_valid,
            description,
        }
    }

    // -------------------------------------------------------------------------
    // Fundamental dimension
    // -------------------------------------------------------------------------

    fn analyze_fundamental(&self, now: DateTime<Utc>) -> FundamentalAnalysis {
        let upcoming = self.events_or_empty(self.store.upcoming_events(now, EVENT_WINDOW_LIMIT));
        let recent = self.events_or_empty(self.store.recent_events(now, EVENT_WINDOW_LIMIT));

        let time_to_next_event = upcoming.first().map(|e| e.release_time - now);

        let mut post_event_window = false;
        let mut event_impact = Alignment::Neutral;

        if let Some(last) = recent.first() {
            let since = now - last.release_time;
            if since < Duration::minutes(POST_EVENT_TRADE_MINUTES) {
                post_event_window = true;

                // A positive surprise is USD-bullish; the sign mapping is the
                // authoritative contract, not a macro theory.
                if let Some(deviation) = last.deviation_from_forecast {
                    if deviation > SURPRISE_DEVIATION {
                        event_impact = Alignment::Bullish;
                    } else if deviation < -SURPRISE_DEVIATION {
                        event_impact = Alignment::Bearish;
                    }
                }
            }
        }

        let description = match time_to_next_event {
            Some(t) if t < Duration::minutes(PRE_EVENT_AVOID_MINUTES) => {
                format!("Caution: high-impact event in {} minutes", t.num_minutes())
            }
            _ if post_event_window => {
                format!("Post-event trading window active, impact: {event_impact}")
            }
            _ => "No immediate macro events affecting market".to_string(),
        };

        FundamentalAnalysis {
            upcoming_events: upcoming,
            recent_events: recent,
            event_impact,
            time_to_next_event,
            post_event_window,
            description,
        }
    }

    fn events_or_empty(&self, result: Result<Vec<EconomicEvent>>) -> Vec<EconomicEvent> {
        result.unwrap_or_else(|e| {
            warn!(error = %e, "event query failed — treating calendar as empty");
            Vec::new()
        })
    }

    // -------------------------------------------------------------------------
    // Technical dimension
    // -------------------------------------------------------------------------

    fn analyze_technical(
        &self,
        klines_by_timeframe: &HashMap<String, Vec<Candle>>,
    ) -> TechnicalAnalysis {
        let mut timeframe_trends = HashMap::new();
        let mut ema_positions = HashMap::new();

        for (tf, klines) in klines_by_timeframe {
            let closes: Vec<f64> = klines.iter().map(|c| c.close).collect();

            let Some(ema) = latest_ema(&closes, self.ema_period) else {
                timeframe_trends.insert(tf.clone(), Alignment::Neutral);
                ema_positions.insert(tf.clone(), 0.0);
                continue;
            };

            let current = closes.last().copied().unwrap_or(0.0);
            let deviation = if ema > 0.0 { (current - ema) / ema } else { 0.0 };
            ema_positions.insert(tf.clone(), deviation);

            let trend = if deviation > self.ema_deviation_threshold {
                Alignment::Bullish
            } else if deviation < -self.ema_deviation_threshold {
                Alignment::Bearish
            } else {
                Alignment::Neutral
            };
            timeframe_trends.insert(tf.clone(), trend);
        }

        let (trend_alignment, primary_trend) = trend_alignment(&timeframe_trends);

        let aligned_count = timeframe_trends
            .values()
            .filter(|t| **t == primary_trend && **t != Alignment::Neutral)
            .count();
        let description = format!(
            "Primary trend: {primary_trend}, {aligned_count}/{} timeframes aligned",
            timeframe_trends.len()
        );

        TechnicalAnalysis {
            timeframe_trends,
            trend_alignment,
            primary_trend,
            ema_positions,
            description,
        }
    }
}

impl std::fmt::Debug for ThreeDAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreeDAnalyzer")
            .field("ema_period", &self.ema_period)
            .field("ema_deviation_threshold", &self.ema_deviation_threshold)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Relational dimension (pure)
// -----------------------------------------------------------------------------

fn analyze_relational(related_prices: &HashMap<String, f64>) -> RelationalAnalysis {
    let mut crypto_health = Alignment::Neutral;
    let mut risk_sentiment = "NEUTRAL".to_string();
    let mut btc_eth_correlation = 0.0;

    if let (Some(&btc), Some(&eth)) = (
        related_prices.get("BTCUSDT"),
        related_prices.get("ETHUSDT"),
    ) {
        if btc > 0.0 {
            // ETH/BTC ratio as an altcoin-appetite proxy; the historical
            // band sits around 0.05-0.08.
            let ratio = eth / btc;
            if ratio > ETH_BTC_HEALTHY {
                crypto_health = Alignment::Bullish;
                risk_sentiment = "RISK_ON".to_string();
            } else if ratio < ETH_BTC_WEAK {
                crypto_health = Alignment::Bearish;
                risk_sentiment = "RISK_OFF".to_string();
            }
            // Majors trade in lockstep; a static proxy stands in for a
            // rolling correlation here.
            btc_eth_correlation = 0.85;
        }
    }

    let health_desc = match crypto_health {
        Alignment::Bullish => "healthy",
        Alignment::Bearish => "weak",
        _ => "neutral",
    };
    let description = format!("Crypto market {health_desc}, Risk sentiment: {risk_sentiment}");

    RelationalAnalysis {
        btc_eth_correlation,
        crypto_health,
        // Extension point; stays neutral until a dollar-index feed exists.
        usd_impact: Alignment::Neutral,
        risk_sentiment,
        description,
    }
}

// -----------------------------------------------------------------------------
// Confluence (pure)
// -----------------------------------------------------------------------------

fn trend_alignment(timeframe_trends: &HashMap<String, Alignment>) -> (f64, Alignment) {
    if timeframe_trends.is_empty() {
        return (0.0, Alignment::Neutral);
    }

    let bullish = timeframe_trends.values().filter(|t| **t == Alignment::Bullish).count();
    let bearish = timeframe_trends.values().filter(|t| **t == Alignment::Bearish).count();
    let total = timeframe_trends.len();

    if bullish > bearish {
        (bullish as f64 / total as f64, Alignment::Bullish)
    } else if bearish > bullish {
        (bearish as f64 / total as f64, Alignment::Bearish)
    } else {
        (0.0, Alignment::Neutral)
    }
}

fn calculate_confluence(
    relational: &RelationalAnalysis,
    fundamental: &FundamentalAnalysis,
    technical: &TechnicalAnalysis,
) -> (Alignment, f64, usize) {
    let mut dimensions: Vec<Alignment> = Vec::new();

    if relational.crypto_health != Alignment::Neutral {
        dimensions.push(relational.crypto_health);
    }
    // The fundamental vote only counts inside the post-event window.
    if fundamental.post_event_window && fundamental.event_impact != Alignment::Neutral {
        dimensions.push(fundamental.event_impact);
    }
    if technical.primary_trend != Alignment::Neutral {
        dimensions.push(technical.primary_trend);
    }

    if dimensions.is_empty() {
        return (Alignment::Neutral, 0.0, 0);
    }

    let bullish = dimensions.iter().filter(|d| **d == Alignment::Bullish).count();
    let bearish = dimensions.iter().filter(|d| **d == Alignment::Bearish).count();

    let (confluence, dimensions_aligned) = if bullish >= 2 {
        (Alignment::Bullish, bullish)
    } else if bearish >= 2 {
        (Alignment::Bearish, bearish)
    } else if bullish == 1 && bearish == 1 {
        (Alignment::Conflicting, 0)
    } else if bullish == 1 {
        (Alignment::Bullish, 1)
    } else if bearish == 1 {
        (Alignment::Bearish, 1)
    } else {
        (Alignment::Neutral, 0)
    };

    let mut confluence_score = dimensions_aligned as f64 / dimensions.len().max(1) as f64;

    // Strong multi-timeframe agreement earns a boost.
    if technical.trend_alignment >= 0.75 {
        confluence_score = (confluence_score * 1.2).min(1.0);
    }

    (confluence, confluence_score, dimensions_aligned)
}

fn is_valid_signal(
    confluence: Alignment,
    confluence_score: f64,
    dimensions_aligned: usize,
    fundamental: &FundamentalAnalysis,
) -> bool {
    if confluence == Alignment::Conflicting || confluence == Alignment::Neutral {
        return false;
    }
    if dimensions_aligned < 2 {
        return false;
    }
    // Stand aside ahead of a scheduled release.
    if let Some(time_to_next) = fundamental.time_to_next_event {
        if time_to_next < Duration::minutes(PRE_EVENT_AVOID_MINUTES) {
            return false;
        }
    }
    confluence_score >= MIN_CONFLUENCE_SCORE
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventImpact, EventType};

    fn analyzer() -> ThreeDAnalyzer {
        ThreeDAnalyzer::new(Arc::new(Store::open_in_memory().unwrap()), 20, 0.005)
    }

    fn analyzer_with_store(store: Arc<Store>) -> ThreeDAnalyzer {
        ThreeDAnalyzer::new(store, 20, 0.005)
    }

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .map(|c| Candle::new(0, *c, c + 0.5, c - 0.5, *c, 100.0, 0))
            .collect()
    }

    /// Steadily rising closes: the last price sits well above EMA(20).
    fn rising_klines() -> HashMap<String, Vec<Candle>> {
        let closes: Vec<f64> = (1..=40).map(|i| 100.0 + i as f64).collect();
        TIMEFRAMES
            .iter()
            .map(|tf| (tf.to_string(), candles_from_closes(&closes)))
            .collect()
    }

    fn risk_on_prices() -> HashMap<String, f64> {
        HashMap::from([
            ("BTCUSDT".to_string(), 40_000.0),
            ("ETHUSDT".to_string(), 2_800.0), // ratio 0.07
        ])
    }

    fn event(minutes_from_now: i64, impact: EventImpact, deviation: Option<f64>) -> EconomicEvent {
        EconomicEvent {
            id: 0,
            event_type: EventType::Cpi,
            country: "US".into(),
            title: "CPI YoY".into(),
            release_time: Utc::now() + Duration::minutes(minutes_from_now),
            forecast: Some(3.2),
            actual: deviation.map(|_| 3.4),
            previous: None,
            impact,
            deviation_from_forecast: deviation,
            source: "calendar".into(),
            external_id: String::new(),
        }
    }

    #[test]
    fn relational_bands() {
        let healthy = analyze_relational(&risk_on_prices());
        assert_eq!(healthy.crypto_health, Alignment::Bullish);
        assert_eq!(healthy.risk_sentiment, "RISK_ON");

        let weak = analyze_relational(&HashMap::from([
            ("BTCUSDT".to_string(), 40_000.0),
            ("ETHUSDT".to_string(), 1_200.0), // ratio 0.03
        ]));
        assert_eq!(weak.crypto_health, Alignment::Bearish);
        assert_eq!(weak.risk_sentiment, "RISK_OFF");

        let empty = analyze_relational(&HashMap::new());
        assert_eq!(empty.crypto_health, Alignment::Neutral);
        assert_eq!(empty.btc_eth_correlation, 0.0);
    }

    #[test]
    fn technical_alignment_counts_majority() {
        let a = analyzer();
        let mut klines = rising_klines();
        // One falling timeframe out of four.
        let falling: Vec<f64> = (1..=40).map(|i| 200.0 - i as f64).collect();
        klines.insert("1h".to_string(), candles_from_closes(&falling));

        let technical = a.analyze_technical(&klines);
        assert_eq!(technical.primary_trend, Alignment::Bullish);
        assert!((technical.trend_alignment - 0.75).abs() < 1e-12);
    }

    #[test]
    fn technical_short_series_is_neutral() {
        let a = analyzer();
        let klines = HashMap::from([(
            "1m".to_string(),
            candles_from_closes(&[100.0, 101.0, 102.0]),
        )]);
        let technical = a.analyze_technical(&klines);
        assert_eq!(technical.timeframe_trends["1m"], Alignment::Neutral);
        assert_eq!(technical.ema_positions["1m"], 0.0);
    }

    #[test]
    fn two_bullish_dimensions_make_valid_signal() {
        let a = analyzer();
        let signal = a.analyze("BTCUSDT", &rising_klines(), &risk_on_prices(), Utc::now());

        assert_eq!(signal.confluence, Alignment::Bullish);
        assert_eq!(signal.dimensions_aligned, 2);
        // 2/2 aligned, boosted by full timeframe agreement, clamped to 1.0.
        assert!((signal.confluence_score - 1.0).abs() < 1e-12);
        assert!(signal.is_valid);
    }

    #[test]
    fn single_dimension_is_not_tradeable() {
        let a = analyzer();
        // Neutral relational read (no related prices), bullish technicals.
        let signal = a.analyze("BTCUSDT", &rising_klines(), &HashMap::new(), Utc::now());
        assert_eq!(signal.confluence, Alignment::Bullish);
        assert_eq!(signal.dimensions_aligned, 1);
        assert!(!signal.is_valid);
    }

    #[test]
    fn pre_event_guard_blocks_otherwise_valid_signal() {
        // High-impact CPI scheduled in 20 minutes.
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_event(&event(20, EventImpact::High, None)).unwrap();

        let a = analyzer_with_store(store);
        let signal = a.analyze("BTCUSDT", &rising_klines(), &risk_on_prices(), Utc::now());

        // Everything else lines up...
        assert_eq!(signal.confluence, Alignment::Bullish);
        assert!(signal.dimensions_aligned >= 2);
        // ...but the release is closer than 30 minutes.
        assert!(!signal.is_valid);
        assert!(signal.fundamental.time_to_next_event.unwrap() < Duration::minutes(30));
    }

    #[test]
    fn post_event_window_adds_fundamental_vote() {
        // Release 30 minutes ago with a strong positive surprise.
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_event(&event(-30, EventImpact::High, Some(1.2)))
            .unwrap();

        let a = analyzer_with_store(store);
        let signal = a.analyze("BTCUSDT", &rising_klines(), &risk_on_prices(), Utc::now());

        assert!(signal.fundamental.post_event_window);
        assert_eq!(signal.fundamental.event_impact, Alignment::Bullish);
        assert_eq!(signal.dimensions_aligned, 3);
        assert!(signal.is_valid);
    }

    #[test]
    fn stale_event_outside_window_is_ignored() {
        // Release 90 minutes ago: inside the 2h query window but past the
        // 60-minute trading window.
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_event(&event(-90, EventImpact::High, Some(1.2)))
            .unwrap();

        let a = analyzer_with_store(store);
        let signal = a.analyze("BTCUSDT", &rising_klines(), &risk_on_prices(), Utc::now());

        assert!(!signal.fundamental.post_event_window);
        assert_eq!(signal.fundamental.event_impact, Alignment::Neutral);
    }

    #[test]
    fn conflicting_dimensions_invalidate() {
        let relational = RelationalAnalysis {
            btc_eth_correlation: 0.85,
            crypto_health: Alignment::Bullish,
            usd_impact: Alignment::Neutral,
            risk_sentiment: "RISK_ON".into(),
            description: String::new(),
        };
        let fundamental = FundamentalAnalysis {
            upcoming_events: vec![],
            recent_events: vec![],
            event_impact: Alignment::Neutral,
            time_to_next_event: None,
            post_event_window: false,
            description: String::new(),
        };
        let technical = TechnicalAnalysis {
            timeframe_trends: HashMap::from([("1m".to_string(), Alignment::Bearish)]),
            trend_alignment: 0.25,
            primary_trend: Alignment::Bearish,
            ema_positions: HashMap::new(),
            description: String::new(),
        };

        let (confluence, score, aligned) =
            calculate_confluence(&relational, &fundamental, &technical);
        assert_eq!(confluence, Alignment::Conflicting);
        assert_eq!(aligned, 0);
        assert_eq!(score, 0.0);
        assert!(!is_valid_signal(confluence, score, aligned, &fundamental));
    }

    #[test]
    fn empty_dimensions_are_neutral() {
        let (alignment, primary) = trend_alignment(&HashMap::new());
        assert_eq!(alignment, 0.0);
        assert_eq!(primary, Alignment::Neutral);
    }
}
