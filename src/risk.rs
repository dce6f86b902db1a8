// =============================================================================
// Risk Manager — position sizing, slippage admission, trailing stops,
// and the daily drawdown circuit breaker
// =============================================================================
//
// Four responsibilities guard capital:
//   1. Position sizing  — fixed-fraction risk against the stop distance.
//   2. Slippage check   — walk the book ladder before committing quantity.
//   3. Trailing stops   — ratchet stops toward profit, report hits upstream.
//   4. Circuit breaker  — pause the whole engine on the daily drawdown limit.
//
// The risk manager never closes positions itself; stop hits are reported and
// the execution loop orchestrates exits.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::binance::{BinanceClient, SymbolInfo};
use crate::binance::client::round_down_to_step;
use crate::cache::{DashboardMessage, MarketCache, DASHBOARD_CHANNEL};
use crate::config::Config;
use crate::models::Position;
use crate::store::Store;
use crate::types::{Side, SystemStatus};

/// ATR multiple used for the initial stop distance.
pub const DEFAULT_RISK_MULTIPLE: f64 = 2.0;
/// Fallback stop distance when no ATR is available (1 % of entry).
const FALLBACK_STOP_PCT: f64 = 0.01;

/// Quote asset all balances and notionals are denominated in.
const QUOTE_ASSET: &str = "USDT";

// -----------------------------------------------------------------------------
// Result types
// -----------------------------------------------------------------------------

/// Outcome of a position-sizing calculation.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSizeResult {
    pub quantity: f64,
    pub risk_amount: f64,
    pub stop_distance: f64,
    pub position_value: f64,
    pub risk_pct: f64,
    pub is_valid: bool,
    pub reason: String,
}

impl PositionSizeResult {
    fn invalid(risk_pct: f64, reason: impl Into<String>) -> Self {
        Self {
            quantity: 0.0,
            risk_amount: 0.0,
            stop_distance: 0.0,
            position_value: 0.0,
            risk_pct,
            is_valid: false,
            reason: reason.into(),
        }
    }
}

/// Outcome of a slippage admission check.
#[derive(Debug, Clone, Serialize)]
pub struct SlippageCheck {
    pub estimated_slippage_pct: f64,
    pub is_acceptable: bool,
    pub sufficient_liquidity: bool,
    pub estimated_avg_price: f64,
    pub reason: String,
}

/// What the minute-cadence circuit-breaker evaluation found.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerVerdict {
    /// Trading may continue.
    Clear,
    /// The drawdown limit was crossed this evaluation; trigger now.
    Tripped(String),
    /// The system was already paused earlier.
    AlreadyPaused(String),
}

// -----------------------------------------------------------------------------
// Pure calculations
// -----------------------------------------------------------------------------

/// Fixed-fraction position sizing.
///
///   risk_amount   = balance * risk_pct
///   stop_distance = |entry - stop|
///   quantity      = risk_amount / stop_distance, floored to step_size
///
/// Rejected when the balance is gone, the stop distance is zero, or the
/// resulting order would violate the exchange minimums.
pub fn size_position(
    info: &SymbolInfo,
    balance: f64,
    risk_pct: f64,
    entry_price: f64,
    stop_price: f64,
) -> PositionSizeResult {
    if balance <= 0.0 {
        return PositionSizeResult::invalid(risk_pct, "Insufficient account balance");
    }

    let risk_amount = balance * risk_pct;
    let stop_distance = (entry_price - stop_price).abs();
    if stop_distance <= 0.0 {
        return PositionSizeResult::invalid(risk_pct, "Invalid stop distance (must be > 0)");
    }

    let quantity = round_down_to_step(risk_amount / stop_distance, info.step_size);
    let position_value = quantity * entry_price;

    if position_value < info.min_notional {
        return PositionSizeResult {
            quantity,
            risk_amount,
            stop_distance,
            position_value,
            risk_pct,
            is_valid: false,
            reason: format!(
                "Position value {position_value:.2} below minimum notional {}",
                info.min_notional
            ),
        };
    }
    if quantity < info.min_qty {
        return PositionSizeResult {
            quantity,
            risk_amount,
            stop_distance,
            position_value,
            risk_pct,
            is_valid: false,
            reason: format!("Quantity {quantity} below minimum {}", info.min_qty),
        };
    }

    PositionSizeResult {
        quantity,
        risk_amount,
        stop_distance,
        position_value,
        risk_pct,
        is_valid: true,
        reason: "Position size valid".to_string(),
    }
}

/// Walk the opposite-side ladder from the top, filling `quantity`, and
/// compare the volume-weighted price against the best level.
pub fn assess_slippage(
    levels: &[(f64, f64)],
    quantity: f64,
    max_slippage_pct: f64,
) -> SlippageCheck {
    if levels.is_empty() {
        return SlippageCheck {
            estimated_slippage_pct: 999.0,
            is_acceptable: false,
            sufficient_liquidity: false,
            estimated_avg_price: 0.0,
            reason: "Empty order book".to_string(),
        };
    }

    let best_price = levels[0].0;
    let mut remaining = quantity;
    let mut total_cost = 0.0;

    for (price, qty) in levels {
        if remaining <= 0.0 {
            break;
        }
        let fill = remaining.min(*qty);
        total_cost += fill * price;
        remaining -= fill;
    }

    if remaining > 0.0 {
        return SlippageCheck {
            estimated_slippage_pct: 100.0,
            is_acceptable: false,
            sufficient_liquidity: false,
            estimated_avg_price: 0.0,
            reason: format!("Insufficient liquidity: {remaining} remaining"),
        };
    }

    let avg_price = total_cost / quantity;
    let slippage_pct = ((avg_price - best_price).abs() / best_price) * 100.0;
    let is_acceptable = slippage_pct <= max_slippage_pct * 100.0;

    let reason = if is_acceptable {
        "Slippage acceptable".to_string()
    } else {
        format!(
            "Slippage {slippage_pct:.2}% exceeds max {:.2}%",
            max_slippage_pct * 100.0
        )
    };

    SlippageCheck {
        estimated_slippage_pct: slippage_pct,
        is_acceptable,
        sufficient_liquidity: true,
        estimated_avg_price: avg_price,
        reason,
    }
}

/// Initial stop placement: ATR-scaled when available, otherwise a 1 % stop.
pub fn initial_stop_price(
    entry_price: f64,
    side: Side,
    atr: Option<f64>,
    risk_multiple: f64,
) -> f64 {
    let stop_distance = match atr {
        Some(atr) if atr > 0.0 => atr * risk_multiple,
        _ => entry_price * FALLBACK_STOP_PCT,
    };

    match side {
        Side::Buy => entry_price - stop_distance,
        Side::Sell => entry_price + stop_distance,
    }
}

// -----------------------------------------------------------------------------
// Manager
// -----------------------------------------------------------------------------

pub struct RiskManager {
    client: Arc<BinanceClient>,
    cache: Arc<MarketCache>,
    store: Arc<Store>,
    symbols: Vec<String>,
    account_risk_pct: f64,
    max_slippage_pct: f64,
    trailing_trigger_pct: f64,
    daily_drawdown_limit: f64,
}

impl RiskManager {
    pub fn new(
        client: Arc<BinanceClient>,
        cache: Arc<MarketCache>,
        store: Arc<Store>,
        config: &Config,
    ) -> Self {
        info!(
            account_risk_pct = config.account_risk_pct,
            max_slippage_pct = config.max_slippage_pct,
            trailing_trigger_pct = config.trailing_trigger_pct,
            daily_drawdown_limit = config.daily_drawdown_limit,
            "RiskManager initialised"
        );
        Self {
            client,
            cache,
            store,
            symbols: config.symbols.clone(),
            account_risk_pct: config.account_risk_pct,
            max_slippage_pct: config.max_slippage_pct,
            trailing_trigger_pct: config.trailing_trigger_pct,
            daily_drawdown_limit: config.daily_drawdown_limit,
        }
    }

    // -------------------------------------------------------------------------
    // Position sizing
    // -------------------------------------------------------------------------

    /// Size a position for `symbol`, fetching the quote balance when the
    /// caller does not supply one.
    pub async fn calculate_position_size(
        &self,
        symbol: &str,
        entry_price: f64,
        stop_price: f64,
        account_balance: Option<f64>,
    ) -> Result<PositionSizeResult> {
        let balance = match account_balance {
            Some(b) => b,
            None => self
                .client
                .get_balance(QUOTE_ASSET)
                .await
                .context("failed to fetch balance for sizing")?,
        };

        let info = self.client.get_symbol_info(symbol).await?;
        let result = size_position(&info, balance, self.account_risk_pct, entry_price, stop_price);

        if result.is_valid {
            info!(
                symbol,
                quantity = result.quantity,
                risk_amount = result.risk_amount,
                stop_distance = result.stop_distance,
                "position size calculated"
            );
        } else {
            debug!(symbol, reason = %result.reason, "position sizing rejected");
        }
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Slippage admission
    // -------------------------------------------------------------------------

    /// Check whether `quantity` can execute within the slippage tolerance,
    /// using the cached book when fresh and falling back to a REST depth
    /// fetch otherwise.
    pub async fn check_slippage(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<SlippageCheck> {
        let (bids, asks) = match self.cache.get_order_book(symbol) {
            Some(book) => (book.bids(), book.asks()),
            None => {
                let depth = self
                    .client
                    .get_order_book_depth(symbol, 100)
                    .await
                    .context("failed to fetch depth for slippage check")?;
                (depth.bids, depth.asks)
            }
        };

        let levels = match side {
            Side::Buy => &asks,
            Side::Sell => &bids,
        };

        let check = assess_slippage(levels, quantity, self.max_slippage_pct);
        info!(
            symbol,
            side = %side,
            quantity,
            slippage_pct = check.estimated_slippage_pct,
            acceptable = check.is_acceptable,
            "slippage check"
        );
        Ok(check)
    }

    // -------------------------------------------------------------------------
    // Trailing stops
    // -------------------------------------------------------------------------

    /// Update one position's PnL and trailing-stop state from the latest
    /// price. Returns `true` when the stop is hit; closing is the execution
    /// loop's job.
    pub fn update_position_risk(&self, position: &mut Position, current_price: f64) -> bool {
        position.update_unrealized_pnl(current_price);
        position.update_trailing_stop(current_price, self.trailing_trigger_pct);

        let stop_hit = position.is_stop_hit(current_price);
        if stop_hit {
            warn!(
                id = %position.id,
                symbol = %position.symbol,
                price = current_price,
                stop = position.current_stop,
                "stop hit — reporting to execution loop"
            );
        }
        stop_hit
    }

    /// Initial stop for a new position (ATR x multiple, 1 % fallback).
    pub fn stop_loss_price(&self, entry_price: f64, side: Side, atr: Option<f64>) -> f64 {
        initial_stop_price(entry_price, side, atr, DEFAULT_RISK_MULTIPLE)
    }

    // -------------------------------------------------------------------------
    // Circuit breaker
    // -------------------------------------------------------------------------

    /// Minute-cadence evaluation: refresh the daily ledger with the current
    /// balance and decide whether the drawdown limit was crossed.
    pub async fn check_circuit_breaker(&self) -> Result<BreakerVerdict> {
        let balance = self
            .client
            .get_balance(QUOTE_ASSET)
            .await
            .context("failed to fetch balance for circuit breaker")?;

        let today = Utc::now().date_naive();
        let mut state = self.store.get_or_create_risk_state(today, balance)?;

        if state.system_status == SystemStatus::Paused {
            return Ok(BreakerVerdict::AlreadyPaused(state.pause_reason));
        }

        state.update_balance(balance);
        self.store.update_risk_state(&state)?;

        let limit_pct = self.daily_drawdown_limit * 100.0;
        if state.drawdown_pct >= limit_pct {
            let reason = format!(
                "Daily drawdown {:.2}% exceeded limit {:.2}%",
                state.drawdown_pct, limit_pct
            );
            error!(
                drawdown_pct = state.drawdown_pct,
                limit_pct, "CIRCUIT BREAKER CONDITION MET"
            );
            return Ok(BreakerVerdict::Tripped(reason));
        }

        Ok(BreakerVerdict::Clear)
    }

    /// Trip the breaker: pause the daily ledger, cancel all open orders on
    /// every configured symbol (best effort, per-symbol isolation), and
    /// flip the cache status flag that preempts signal generation.
    pub async fn trigger_circuit_breaker(&self, reason: &str) -> Result<()> {
        error!(reason, "TRIGGERING CIRCUIT BREAKER");

        let today = Utc::now().date_naive();
        let mut state = self.store.get_or_create_risk_state(today, 0.0)?;
        state.trigger_circuit_breaker(reason);
        self.store.update_risk_state(&state)?;

        for symbol in &self.symbols {
            if let Err(e) = self.client.cancel_all_orders(symbol).await {
                // One symbol failing must not stop the sweep.
                error!(symbol, error = %e, "failed to cancel open orders");
            }
        }

        self.cache.set_system_status(SystemStatus::Paused, reason);
        self.cache.publish(
            DASHBOARD_CHANNEL,
            &DashboardMessage::SystemStatus {
                status: SystemStatus::Paused.as_str().to_string(),
                reason: reason.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            },
        );

        info!("circuit breaker activated");
        Ok(())
    }

    /// Fast gate consulted before every evaluation: the cache flag first,
    /// the durable risk state second.
    pub fn is_trading_allowed(&self) -> (bool, String) {
        if let Some(status) = self.cache.get_system_status() {
            if status.status != SystemStatus::Active {
                return (false, status.reason);
            }
        }

        match self.store.get_risk_state(Utc::now().date_naive()) {
            Ok(Some(state)) => match state.system_status {
                SystemStatus::Active => (true, String::new()),
                SystemStatus::Paused => (false, state.pause_reason),
                SystemStatus::EmergencyStop => (false, "Emergency stop active".to_string()),
            },
            Ok(None) => (true, String::new()),
            Err(e) => {
                // Fail open: a broken status check must not wedge the engine.
                warn!(error = %e, "risk state read failed during trading gate");
                (true, String::new())
            }
        }
    }

    /// Summary payload for the periodic risk broadcast.
    pub fn current_risk_metrics(&self) -> Result<serde_json::Value> {
        let today = Utc::now().date_naive();
        let state = self
            .store
            .get_risk_state(today)?
            .unwrap_or_else(|| crate::models::RiskState::new(today, 0.0));

        let open_positions = self.store.get_open_positions()?;
        let total_exposure: f64 = open_positions
            .iter()
            .map(|p| p.quantity * p.entry_price)
            .sum();
        let unrealized_pnl: f64 = open_positions.iter().map(|p| p.unrealized_pnl).sum();
        let win_rate = if state.total_trades > 0 {
            state.winning_trades as f64 / state.total_trades as f64 * 100.0
        } else {
            0.0
        };

        Ok(serde_json::json!({
            "date": state.date.format("%Y-%m-%d").to_string(),
            "system_status": state.system_status.as_str(),
            "starting_balance": state.starting_balance.to_string(),
            "current_balance": state.current_balance.to_string(),
            "daily_pnl": state.daily_pnl.to_string(),
            "daily_pnl_pct": state.daily_pnl_pct.to_string(),
            "drawdown_pct": state.drawdown_pct.to_string(),
            "max_drawdown_pct": state.max_drawdown_pct.to_string(),
            "total_trades": state.total_trades,
            "win_rate": win_rate,
            "open_positions": open_positions.len(),
            "total_exposure": total_exposure.to_string(),
            "unrealized_pnl": unrealized_pnl.to_string(),
        }))
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("account_risk_pct", &self.account_risk_pct)
            .field("max_slippage_pct", &self.max_slippage_pct)
            .field("trailing_trigger_pct", &self.trailing_trigger_pct)
            .field("daily_drawdown_limit", &self.daily_drawdown_limit)
            .finish()
    }
}
