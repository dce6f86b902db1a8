// =============================================================================
// Strategy Coordinator — VPA and 3-D confluence into trade signals
// =============================================================================
//
// Signal generation is a conjunction; every gate must pass:
//   1. Trading allowed (circuit breaker / cache flag)
//   2. No open position on the symbol (else evaluate the exit instead)
//   3. VPA pattern valid on the 1m series
//   4. 3-D dimensions aligned
//   5. |EMA-20 deviation| over threshold, with the SIGN in our favor:
//      longs only below the average, shorts only above it
//   6. Risk manager approves size and slippage
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analysis::three_d::{Alignment, ThreeDAnalyzer, ThreeDSignal, TIMEFRAMES};
use crate::analysis::vpa::{TrendDirection, VpaAnalyzer, VpaSignal};
use crate::binance::BinanceClient;
use crate::cache::{DashboardMessage, MarketCache, DASHBOARD_CHANNEL};
use crate::config::Config;
use crate::indicators::atr::calculate_atr;
use crate::indicators::ema::{ema_deviation, latest_ema};
use crate::market_data::Candle;
use crate::models::Position;
use crate::risk::RiskManager;
use crate::store::Store;
use crate::types::{Side, SignalAction};

/// Bars fetched per timeframe for analysis.
const KLINE_FETCH_LIMIT: usize = 50;
/// Minimum cached bars before the exchange fallback kicks in.
const MIN_CACHED_BARS: usize = 20;
/// ATR look-back (hourly bars) for initial stops.
const ATR_PERIOD: usize = 14;
/// Reward-to-risk multiple for take-profit placement.
const TAKE_PROFIT_MULTIPLE: f64 = 2.0;

/// Assets consulted for the relational dimension.
const RELATED_SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT", "BNBUSDT"];

// -----------------------------------------------------------------------------
// TradeSignal
// -----------------------------------------------------------------------------

/// Complete trading signal with all strategy context.
#[derive(Debug, Clone, Serialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub action: SignalAction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub quantity: f64,
    /// 0.0 to 1.0.
    pub confidence: f64,

    // Strategy context carried onto the persisted trade.
    pub vpa_pattern: String,
    pub vpa_description: String,
    pub three_d_confluence: String,
    pub ema_deviation: f64,
    pub macro_context: String,

    pub is_valid: bool,
    pub rejection_reason: String,
}

impl TradeSignal {
    /// Cache representation with decimal fields as strings.
    pub fn to_cache_value(&self) -> serde_json::Value {
        serde_json::json!({
            "symbol": self.symbol,
            "action": self.action.as_str(),
            "entry_price": self.entry_price.to_string(),
            "stop_loss": self.stop_loss.to_string(),
            "take_profit": self.take_profit.map(|t| t.to_string()),
            "quantity": self.quantity.to_string(),
            "confidence": self.confidence,
            "vpa_pattern": self.vpa_pattern,
            "vpa_description": self.vpa_description,
            "three_d_confluence": self.three_d_confluence,
            "ema_deviation": self.ema_deviation.to_string(),
            "macro_context": self.macro_context,
            "is_valid": self.is_valid,
            "rejection_reason": self.rejection_reason,
        })
    }
}

// -----------------------------------------------------------------------------
// Pure gating helpers
// -----------------------------------------------------------------------------

/// Combine the analyzer verdicts and the EMA deviation into an action.
/// Returns (action, is_valid, rejection_reason).
fn gate_signal(
    vpa: &VpaSignal,
    three_d: &ThreeDSignal,
    ema_dev: f64,
    threshold: f64,
) -> (SignalAction, bool, String) {
    if !vpa.is_valid {
        return (
            SignalAction::Hold,
            false,
            format!("VPA not valid: {}", vpa.pattern),
        );
    }
    if !three_d.is_valid {
        return (
            SignalAction::Hold,
            false,
            format!("3D not valid: {}", three_d.confluence),
        );
    }
    if ema_dev.abs() < threshold {
        return (
            SignalAction::Hold,
            false,
            format!("EMA deviation {ema_dev:.4} below threshold"),
        );
    }

    let bullish = vpa.direction == TrendDirection::Bullish
        && three_d.confluence == Alignment::Bullish;
    let bearish = vpa.direction == TrendDirection::Bearish
        && three_d.confluence == Alignment::Bearish;

    // Entries fade the stretch: buy below the average, sell above it.
    if bullish && ema_dev < 0.0 {
        (SignalAction::Buy, true, String::new())
    } else if bearish && ema_dev > 0.0 {
        (SignalAction::Sell, true, String::new())
    } else {
        (
            SignalAction::Hold,
            false,
            "VPA/3D direction mismatch or EMA not in favor".to_string(),
        )
    }
}

/// Weighted confidence: the 3-D read carries more weight than the bar read.
fn combined_confidence(vpa: &VpaSignal, three_d: &ThreeDSignal) -> f64 {
    (0.4 * vpa.strength + 0.6 * three_d.confluence_score).clamp(0.0, 1.0)
}

/// Exit condition for an open position at the given price.
/// Returns the close action and reason, or `None` to keep holding.
fn exit_decision(position: &Position, current_price: f64) -> Option<(SignalAction, &'static str)> {
    match position.side {
        Side::Buy => {
            if current_price <= position.current_stop {
                return Some((SignalAction::CloseLong, "Stop loss triggered"));
            }
            if position.is_take_profit_hit(current_price) {
                return Some((SignalAction::CloseLong, "Take profit reached"));
            }
        }
        Side::Sell => {
            if current_price >= position.current_stop {
                return Some((SignalAction::CloseShort, "Stop loss triggered"));
            }
            if position.is_take_profit_hit(current_price) {
                return Some((SignalAction::CloseShort, "Take profit reached"));
            }
        }
    }
    None
}

fn build_macro_context(three_d: &ThreeDSignal) -> String {
    let mut parts = Vec::new();

    if three_d.fundamental.post_event_window {
        if let Some(event) = three_d.fundamental.recent_events.first() {
            parts.push(format!("Post-{} Volatility", event.event_type));
        }
    }
    parts.push(format!("3D: {}", three_d.confluence));
    parts.push(format!("Crypto: {}", three_d.relational.crypto_health));

    parts.join(" | ")
}

// -----------------------------------------------------------------------------
// Coordinator
// -----------------------------------------------------------------------------

pub struct StrategyCoordinator {
    client: Arc<BinanceClient>,
    cache: Arc<MarketCache>,
    store: Arc<Store>,
    risk: Arc<RiskManager>,
    vpa: VpaAnalyzer,
    three_d: ThreeDAnalyzer,
    symbols: Vec<String>,
    ema_period: usize,
    ema_deviation_threshold: f64,
}

impl StrategyCoordinator {
    pub fn new(
        client: Arc<BinanceClient>,
        cache: Arc<MarketCache>,
        store: Arc<Store>,
        risk: Arc<RiskManager>,
        config: &Config,
    ) -> Self {
        Self {
            client,
            cache: cache.clone(),
            store: store.clone(),
            risk,
            vpa: VpaAnalyzer::new(config.ema_period),
            three_d: ThreeDAnalyzer::new(store, config.ema_period, config.ema_deviation_threshold),
            symbols: config.symbols.clone(),
            ema_period: config.ema_period,
            ema_deviation_threshold: config.ema_deviation_threshold,
        }
    }

    /// Evaluate every configured symbol; returns the valid signals.
    pub async fn evaluate_all_symbols(&self) -> Vec<TradeSignal> {
        let mut signals = Vec::new();
        for symbol in self.symbols.clone() {
            match self.evaluate_symbol(&symbol).await {
                Ok(Some(signal)) if signal.is_valid => signals.push(signal),
                Ok(_) => {}
                Err(e) => warn!(symbol = %symbol, error = %e, "symbol evaluation failed"),
            }
        }
        signals
    }

    /// Evaluate a single symbol for an entry or exit signal.
    pub async fn evaluate_symbol(&self, symbol: &str) -> Result<Option<TradeSignal>> {
        // 1. Circuit breaker / pause gate.
        let (allowed, reason) = self.risk.is_trading_allowed();
        if !allowed {
            debug!(symbol, reason = %reason, "trading not allowed — skipping evaluation");
            return Ok(None);
        }

        // 2. Existing position => exit management only.
        if let Some(position) = self.store.get_open_position(symbol)? {
            return self.evaluate_exit(&position).await;
        }

        // 3. Candle histories per timeframe (cache first, exchange fallback).
        let klines_by_tf = self.fetch_klines(symbol).await;
        let Some(primary) = klines_by_tf.get("1m") else {
            warn!(symbol, "no 1m kline data — skipping");
            return Ok(None);
        };

        // 4. Current price.
        let Some(current_price) = self.current_price(symbol).await else {
            return Ok(None);
        };

        // 5. Related prices for the relational dimension.
        let related_prices = self.related_prices().await;

        // 6. Run both analyzers.
        let vpa_signal = self.vpa.analyze(primary);
        let three_d_signal =
            self.three_d
                .analyze(symbol, &klines_by_tf, &related_prices, Utc::now());

        // 7. EMA deviation on the primary series.
        let closes: Vec<f64> = primary.iter().map(|c| c.close).collect();
        let ema_dev = ema_deviation(&closes, self.ema_period).unwrap_or(0.0);
        if let Some(ema) = latest_ema(&closes, self.ema_period) {
            self.cache.set_ema(symbol, self.ema_period, ema);
        }

        // 8-12. Gate, size, and assemble.
        let signal = self
            .generate_signal(symbol, current_price, &vpa_signal, &three_d_signal, ema_dev)
            .await?;

        if signal.is_valid {
            self.cache.set_signal(symbol, signal.to_cache_value());
            self.cache.publish(
                DASHBOARD_CHANNEL,
                &DashboardMessage::Signal {
                    signal: signal.to_cache_value(),
                },
            );
            info!(symbol, action = %signal.action, confidence = signal.confidence, "valid signal generated");
        } else {
            debug!(symbol, reason = %signal.rejection_reason, "signal rejected");
        }

        Ok(Some(signal))
    }

    // -------------------------------------------------------------------------
    // Signal assembly
    // -------------------------------------------------------------------------

    async fn generate_signal(
        &self,
        symbol: &str,
        current_price: f64,
        vpa_signal: &VpaSignal,
        three_d_signal: &ThreeDSignal,
        ema_dev: f64,
    ) -> Result<TradeSignal> {
        let (action, mut is_valid, mut rejection_reason) =
            gate_signal(vpa_signal, three_d_signal, ema_dev, self.ema_deviation_threshold);

        // 9. Stop from hourly ATR x2 (1% fallback inside the risk manager).
        let atr = self.hourly_atr(symbol).await;
        let stop_side = action.order_side().unwrap_or(Side::Buy);
        let stop_loss = self.risk.stop_loss_price(current_price, stop_side, atr);

        // Sizing and slippage only run on signals that survived the gates.
        let mut quantity = 0.0;
        if is_valid {
            let sizing = self
                .risk
                .calculate_position_size(symbol, current_price, stop_loss, None)
                .await?;
            if !sizing.is_valid {
                is_valid = false;
                rejection_reason = format!("Position sizing failed: {}", sizing.reason);
            } else {
                quantity = sizing.quantity;
                let slippage = self.risk.check_slippage(symbol, stop_side, quantity).await?;
                if !slippage.is_acceptable {
                    is_valid = false;
                    rejection_reason = format!("Slippage too high: {}", slippage.reason);
                }
            }
        }

        // 10. Symmetric 2:1 take profit.
        let take_profit = if is_valid {
            let risk_distance = (current_price - stop_loss).abs();
            Some(match action {
                SignalAction::Buy => current_price + risk_distance * TAKE_PROFIT_MULTIPLE,
                _ => current_price - risk_distance * TAKE_PROFIT_MULTIPLE,
            })
        } else {
            None
        };

        Ok(TradeSignal {
            symbol: symbol.to_string(),
            action,
            entry_price: current_price,
            stop_loss,
            take_profit,
            quantity,
            confidence: combined_confidence(vpa_signal, three_d_signal),
            vpa_pattern: vpa_signal.pattern.as_str().to_string(),
            vpa_description: vpa_signal.description.clone(),
            three_d_confluence: three_d_signal.confluence.as_str().to_string(),
            ema_deviation: ema_dev,
            macro_context: build_macro_context(three_d_signal),
            is_valid,
            rejection_reason,
        })
    }

    /// Exit evaluation for an open position: stop or take-profit crossings
    /// produce a CLOSE signal; everything else holds.
    pub async fn evaluate_exit(&self, position: &Position) -> Result<Option<TradeSignal>> {
        let Some(current_price) = self.current_price(&position.symbol).await else {
            return Ok(None);
        };

        let mut tracked = position.clone();
        tracked.update_unrealized_pnl(current_price);

        let Some((action, reason)) = exit_decision(&tracked, current_price) else {
            return Ok(None);
        };

        info!(
            symbol = %position.symbol,
            position_id = %position.id,
            action = %action,
            reason,
            price = current_price,
            "exit signal generated"
        );

        Ok(Some(TradeSignal {
            symbol: position.symbol.clone(),
            action,
            entry_price: current_price,
            stop_loss: 0.0,
            take_profit: None,
            quantity: position.quantity,
            confidence: 1.0,
            vpa_pattern: "EXIT".to_string(),
            vpa_description: reason.to_string(),
            three_d_confluence: "N/A".to_string(),
            ema_deviation: 0.0,
            macro_context: reason.to_string(),
            is_valid: true,
            rejection_reason: String::new(),
        }))
    }

    // -------------------------------------------------------------------------
    // Data access (cache fast path, exchange fallback)
    // -------------------------------------------------------------------------

    async fn fetch_klines(&self, symbol: &str) -> HashMap<String, Vec<Candle>> {
        let mut klines_by_tf = HashMap::new();

        for tf in TIMEFRAMES {
            let cached = self.cache.get_kline_history(symbol, tf, KLINE_FETCH_LIMIT);
            if cached.len() >= MIN_CACHED_BARS {
                klines_by_tf.insert(tf.to_string(), cached);
                continue;
            }

            match self
                .client
                .get_klines(symbol, tf, KLINE_FETCH_LIMIT as u32)
                .await
            {
                Ok(klines) => {
                    if let Some(last) = klines.last() {
                        self.cache.set_latest_kline(symbol, tf, last);
                    }
                    klines_by_tf.insert(tf.to_string(), klines);
                }
                Err(e) => {
                    warn!(symbol, tf, error = %e, "kline fetch failed");
                }
            }
        }

        klines_by_tf
    }

    async fn current_price(&self, symbol: &str) -> Option<f64> {
        if let Some(price) = self.cache.get_price(symbol) {
            return Some(price);
        }
        match self.client.get_ticker_price(symbol).await {
            Ok(price) => {
                self.cache.set_price(symbol, price);
                Some(price)
            }
            Err(e) => {
                warn!(symbol, error = %e, "price fetch failed — falling back to latest kline");
                self.cache
                    .get_latest_kline(symbol, "1m")
                    .map(|candle| candle.close)
            }
        }
    }

    async fn related_prices(&self) -> HashMap<String, f64> {
        let mut prices = self.cache.get_prices(RELATED_SYMBOLS);
        for symbol in RELATED_SYMBOLS {
            if !prices.contains_key(*symbol) {
                if let Some(price) = self.current_price(symbol).await {
                    prices.insert(symbol.to_string(), price);
                }
            }
        }
        prices
    }

    async fn hourly_atr(&self, symbol: &str) -> Option<f64> {
        let cached = self.cache.get_kline_history(symbol, "1h", ATR_PERIOD + 1);
        let bars = if cached.len() >= ATR_PERIOD + 1 {
            cached
        } else {
            match self
                .client
                .get_klines(symbol, "1h", (ATR_PERIOD + 1) as u32)
                .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(symbol, error = %e, "ATR kline fetch failed");
                    return None;
                }
            }
        };
        calculate_atr(&bars, ATR_PERIOD)
    }
}

impl std::fmt::Debug for StrategyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyCoordinator")
            .field("symbols", &self.symbols)
            .field("ema_period", &self.ema_period)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::three_d::{
        FundamentalAnalysis, RelationalAnalysis, TechnicalAnalysis,
    };
    use crate::analysis::vpa::VpaPattern;

    fn vpa(valid: bool, direction: TrendDirection, strength: f64) -> VpaSignal {
        VpaSignal {
            pattern: VpaPattern::ClimaxLow,
            direction,
            strength,
            description: String::new(),
            volume_anomaly: 3.0,
            spread_ratio: 1.8,
            close_position: 0.1,
            is_valid: valid,
        }
    }

    fn three_d(valid: bool, confluence: Alignment, score: f64) -> ThreeDSignal {
        ThreeDSignal {
            relational: RelationalAnalysis {
                btc_eth_correlation: 0.85,
                crypto_health: Alignment::Neutral,
                usd_impact: Alignment::Neutral,
                risk_sentiment: "NEUTRAL".into(),
                description: String::new(),
            },
            fundamental: FundamentalAnalysis {
                upcoming_events: vec![],
                recent_events: vec![],
                event_impact: Alignment::Neutral,
                time_to_next_event: None,
                post_event_window: false,
                description: String::new(),
            },
            technical: TechnicalAnalysis {
                timeframe_trends: HashMap::new(),
                trend_alignment: 0.0,
                primary_trend: confluence,
                ema_positions: HashMap::new(),
                description: String::new(),
            },
            confluence,
            confluence_score: score,
            dimensions_aligned: if valid { 2 } else { 0 },
            is_valid: valid,
            description: String::new(),
        }
    }

    // ---- gating -----------------------------------------------------------

    #[test]
    fn buy_requires_bullish_agreement_below_ema() {
        let (action, valid, _) = gate_signal(
            &vpa(true, TrendDirection::Bullish, 0.9),
            &three_d(true, Alignment::Bullish, 0.8),
            -0.01,
            0.005,
        );
        assert_eq!(action, SignalAction::Buy);
        assert!(valid);
    }

    #[test]
    fn sell_requires_bearish_agreement_above_ema() {
        let (action, valid, _) = gate_signal(
            &vpa(true, TrendDirection::Bearish, 0.9),
            &three_d(true, Alignment::Bearish, 0.8),
            0.01,
            0.005,
        );
        assert_eq!(action, SignalAction::Sell);
        assert!(valid);
    }

    #[test]
    fn bullish_agreement_above_ema_is_rejected() {
        // Right direction, wrong side of the average.
        let (action, valid, reason) = gate_signal(
            &vpa(true, TrendDirection::Bullish, 0.9),
            &three_d(true, Alignment::Bullish, 0.8),
            0.01,
            0.005,
        );
        assert_eq!(action, SignalAction::Hold);
        assert!(!valid);
        assert!(reason.contains("mismatch"));
    }

    #[test]
    fn small_deviation_is_rejected() {
        let (_, valid, reason) = gate_signal(
            &vpa(true, TrendDirection::Bullish, 0.9),
            &three_d(true, Alignment::Bullish, 0.8),
            -0.001,
            0.005,
        );
        assert!(!valid);
        assert!(reason.contains("below threshold"));
    }

    #[test]
    fn invalid_analyzers_short_circuit() {
        let (_, valid, reason) = gate_signal(
            &vpa(false, TrendDirection::Bullish, 0.9),
            &three_d(true, Alignment::Bullish, 0.8),
            -0.01,
            0.005,
        );
        assert!(!valid);
        assert!(reason.starts_with("VPA not valid"));

        let (_, valid, reason) = gate_signal(
            &vpa(true, TrendDirection::Bullish, 0.9),
            &three_d(false, Alignment::Conflicting, 0.0),
            -0.01,
            0.005,
        );
        assert!(!valid);
        assert!(reason.starts_with("3D not valid"));
    }

    // ---- confidence -------------------------------------------------------

    #[test]
    fn confidence_is_weighted_blend() {
        let c = combined_confidence(
            &vpa(true, TrendDirection::Bullish, 0.9),
            &three_d(true, Alignment::Bullish, 0.8),
        );
        // 0.4 * 0.9 + 0.6 * 0.8 = 0.84
        assert!((c - 0.84).abs() < 1e-12);
    }

    // ---- exit decisions ---------------------------------------------------

    #[test]
    fn long_exit_paths() {
        let mut p = Position::open(1, "BTCUSDT", Side::Buy, 1.0, 100.0, 98.0, Some(104.0));
        assert!(exit_decision(&p, 101.0).is_none());

        let (action, reason) = exit_decision(&p, 97.9).unwrap();
        assert_eq!(action, SignalAction::CloseLong);
        assert!(reason.contains("Stop loss"));

        let (action, reason) = exit_decision(&p, 104.5).unwrap();
        assert_eq!(action, SignalAction::CloseLong);
        assert!(reason.contains("Take profit"));

        // No target set: only the stop can trigger.
        p.take_profit = None;
        assert!(exit_decision(&p, 200.0).is_none());
    }

    #[test]
    fn short_exit_paths() {
        let p = Position::open(1, "ETHUSDT", Side::Sell, 1.0, 100.0, 102.0, Some(96.0));
        assert!(exit_decision(&p, 99.0).is_none());

        let (action, _) = exit_decision(&p, 102.5).unwrap();
        assert_eq!(action, SignalAction::CloseShort);

        let (action, reason) = exit_decision(&p, 95.5).unwrap();
        assert_eq!(action, SignalAction::CloseShort);
        assert!(reason.contains("Take profit"));
    }

    // ---- macro context ----------------------------------------------------

    #[test]
    fn macro_context_without_event_window() {
        let ctx = build_macro_context(&three_d(true, Alignment::Bullish, 0.8));
        assert_eq!(ctx, "3D: BULLISH | Crypto: NEUTRAL");
    }
}
