// =============================================================================
// Execution Engine — order placement, fill monitoring, position lifecycle
// =============================================================================
//
// Pipeline:
//   execute_trade   — LIMIT GTC entry from a signal; Trade persisted PENDING
//   monitor_order   — 2 s poll until the order reaches a terminal status
//   handle_fill     — entry fills create the Position; exit fills realize PnL
//   monitor_positions — 5 s sweep: trailing stops, stop/TP exits
//   close_position  — idempotent MARKET exit under the per-symbol lock
//
// Work model: every unit (an order's monitor loop, a position close) is a
// WorkItem pushed onto the engine's queue; a dispatcher task spawns one
// worker per item, so scheduler ticks stay short and workers run in
// parallel.
//
// A position flips to CLOSED when the exit is INITIATED, not when the exit
// order fills. This is deliberate: the CLOSED flag (plus the advisory lock
// and the conditional store update) is what guarantees a racing second
// worker cannot place a second exit order. The exit trade's own monitor
// completes the record afterwards.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::binance::client::{round_down_to_step, round_to_tick};
use crate::binance::BinanceClient;
use crate::cache::{DashboardMessage, MarketCache, DASHBOARD_CHANNEL};
use crate::market_data::parse_str_f64;
use crate::models::{Position, PositionStatus, Trade};
use crate::risk::RiskManager;
use crate::store::Store;
use crate::strategy::TradeSignal;
use crate::types::{OrderStatus, OrderType, Side, SignalAction};

/// Poll interval while an order is live.
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Consecutive poll failures before the monitor gives up and leaves the
/// trade in its last known status.
const MAX_MONITOR_FAILURES: u32 = 10;
/// Hourly bars for the entry-fill ATR stop.
const ATR_PERIOD: usize = 14;
/// Reward-to-risk multiple for the take-profit attached at entry fill.
const TAKE_PROFIT_MULTIPLE: f64 = 2.0;

// -----------------------------------------------------------------------------
// Work queue
// -----------------------------------------------------------------------------

/// A unit of background work owned by one worker task.
#[derive(Debug)]
enum WorkItem {
    /// Poll an order until terminal.
    MonitorOrder { trade_id: i64 },
    /// Close an open position with the given reason.
    ClosePosition { position_id: String, reason: String },
}

// -----------------------------------------------------------------------------
// Pure helpers
// -----------------------------------------------------------------------------

/// Fold an exchange order payload into the trade row.
///
/// Fill quantity is monotone non-decreasing and capped at the requested
/// quantity; terminal statuses are absorbing.
fn apply_order_update(trade: &mut Trade, order: &serde_json::Value) -> Result<()> {
    let executed = parse_str_f64(&order["executedQty"], "executedQty").unwrap_or(0.0);
    trade.filled_quantity = trade
        .filled_quantity
        .max(executed)
        .min(trade.requested_quantity);

    let cum_quote =
        parse_str_f64(&order["cummulativeQuoteQty"], "cummulativeQuoteQty").unwrap_or(0.0);
    if trade.filled_quantity > 0.0 && cum_quote > 0.0 {
        trade.average_price = Some(cum_quote / trade.filled_quantity);
    }

    let status_str = order["status"]
        .as_str()
        .context("order payload missing status")?;
    if let Some(next) = OrderStatus::from_exchange(status_str) {
        if !trade.status.is_terminal() {
            trade.status = next;
        }
    } else {
        warn!(status = status_str, "unknown exchange order status");
    }
    Ok(())
}

/// Realized PnL of a closed position at the exit fill price, from the
/// position's perspective.
fn realized_pnl(position: &Position, exit_price: f64, quantity: f64) -> f64 {
    match position.side {
        Side::Buy => (exit_price - position.entry_price) * quantity,
        Side::Sell => (position.entry_price - exit_price) * quantity,
    }
}

/// Stop/take-profit targets attached when an entry fill opens a position.
fn entry_targets(entry_price: f64, stop_loss: f64, side: Side) -> (f64, f64) {
    let risk_distance = (entry_price - stop_loss).abs();
    let take_profit = match side {
        Side::Buy => entry_price + risk_distance * TAKE_PROFIT_MULTIPLE,
        Side::Sell => entry_price - risk_distance * TAKE_PROFIT_MULTIPLE,
    };
    (stop_loss, take_profit)
}

/// Exit reason for an open position at a price, or `None` to keep holding.
fn position_exit_reason(position: &Position, price: f64) -> Option<&'static str> {
    let stop_hit = match position.side {
        Side::Buy => price <= position.current_stop,
        Side::Sell => price >= position.current_stop,
    };
    if stop_hit {
        return Some("STOP_LOSS");
    }
    if position.is_take_profit_hit(price) {
        return Some("TAKE_PROFIT");
    }
    None
}

// -----------------------------------------------------------------------------
// Engine
// -----------------------------------------------------------------------------

pub struct ExecutionEngine {
    client: Arc<BinanceClient>,
    cache: Arc<MarketCache>,
    store: Arc<Store>,
    risk: Arc<RiskManager>,
    /// Per-symbol advisory locks (`lock:position:{symbol}` semantics): at
    /// most one worker acts on a symbol's position at a time.
    position_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
}

impl ExecutionEngine {
    /// Build the engine and start its work-queue dispatcher. Must be called
    /// from within a Tokio runtime.
    pub fn new(
        client: Arc<BinanceClient>,
        cache: Arc<MarketCache>,
        store: Arc<Store>,
        risk: Arc<RiskManager>,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            client,
            cache,
            store,
            risk,
            position_locks: Mutex::new(HashMap::new()),
            work_tx,
        });

        tokio::spawn(run_work_queue(engine.clone(), work_rx));
        engine
    }

    fn position_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.position_locks
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn enqueue(&self, item: WorkItem) {
        // Send only fails when the dispatcher died, which only happens at
        // runtime shutdown.
        if let Err(e) = self.work_tx.send(item) {
            error!(error = %e, "work queue closed — dropping item");
        }
    }

    // -------------------------------------------------------------------------
    // Entry execution
    // -------------------------------------------------------------------------

    /// Place a LIMIT GTC order for a validated signal and persist its trade
    /// row. Returns the trade id; the fill monitor is enqueued before return.
    pub async fn execute_trade(&self, signal: &TradeSignal) -> Result<i64> {
        let side = signal
            .action
            .order_side()
            .context("HOLD signal cannot be executed")?;

        // Never place an order whose trade row we cannot persist.
        self.store
            .ping()
            .context("store unavailable — refusing to place order")?;

        let info = self.client.get_symbol_info(&signal.symbol).await?;
        let price = round_to_tick(signal.entry_price, info.tick_size);
        let quantity = round_down_to_step(signal.quantity, info.step_size);
        if quantity <= 0.0 {
            anyhow::bail!("formatted quantity is zero for {}", signal.symbol);
        }

        let client_order_id = Uuid::new_v4().simple().to_string();

        info!(
            symbol = %signal.symbol,
            action = %signal.action,
            side = %side,
            price,
            quantity,
            "submitting entry order"
        );

        let order = self
            .client
            .place_order(
                &signal.symbol,
                side,
                OrderType::Limit,
                quantity,
                Some(price),
                Some("GTC"),
                None,
                Some(&client_order_id),
            )
            .await
            .context("order placement rejected")?;

        let exchange_order_id = order["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .context("order response missing orderId")?;

        let mut trade = Trade::pending(
            exchange_order_id,
            client_order_id,
            &signal.symbol,
            side,
            OrderType::Limit,
            quantity,
            Some(price),
            Some(signal.entry_price),
        );
        trade.macro_context = signal.macro_context.clone();
        trade.vpa_pattern = signal.vpa_pattern.clone();
        trade.three_d_signal = signal.three_d_confluence.clone();
        trade.ema_deviation = Some(signal.ema_deviation);

        trade.id = match self.store.insert_trade(&trade) {
            Ok(id) => id,
            Err(e) => {
                // The order is live but unrecorded — pull it back.
                error!(
                    symbol = %signal.symbol,
                    order_id = %trade.exchange_order_id,
                    error = %e,
                    "trade insert failed after placement — cancelling order"
                );
                if let Err(cancel_err) = self
                    .client
                    .cancel_order(&signal.symbol, &trade.exchange_order_id)
                    .await
                {
                    error!(error = %cancel_err, "compensating cancel failed");
                }
                return Err(e);
            }
        };

        self.cache.clear_signal(&signal.symbol);
        self.publish_trade(&trade, false);
        self.enqueue(WorkItem::MonitorOrder { trade_id: trade.id });

        Ok(trade.id)
    }

    // -------------------------------------------------------------------------
    // Order monitoring
    // -------------------------------------------------------------------------

    async fn monitor_order(&self, trade_id: i64) {
        let mut failures = 0u32;

        loop {
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;

            let mut trade = match self.store.get_trade(trade_id) {
                Ok(Some(trade)) => trade,
                Ok(None) => {
                    error!(trade_id, "trade vanished from store — stopping monitor");
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!(trade_id, error = %e, failures, "trade load failed");
                    if failures >= MAX_MONITOR_FAILURES {
                        error!(trade_id, "order monitor giving up after repeated failures");
                        return;
                    }
                    continue;
                }
            };

            if trade.status.is_terminal() {
                return;
            }

            let order = match self
                .client
                .get_order(&trade.symbol, &trade.exchange_order_id)
                .await
            {
                Ok(order) => {
                    failures = 0;
                    order
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        trade_id,
                        symbol = %trade.symbol,
                        error = %e,
                        failures,
                        "order poll failed"
                    );
                    if failures >= MAX_MONITOR_FAILURES {
                        error!(
                            trade_id,
                            status = %trade.status,
                            "order monitor exhausted retries — trade left in last known status"
                        );
                        return;
                    }
                    continue;
                }
            };

            if let Err(e) = apply_order_update(&mut trade, &order) {
                warn!(trade_id, error = %e, "malformed order payload");
                continue;
            }

            match trade.status {
                OrderStatus::PartiallyFilled => {
                    debug!(
                        trade_id,
                        filled = trade.filled_quantity,
                        requested = trade.requested_quantity,
                        "partial fill"
                    );
                    self.persist_trade(&trade);
                    self.publish_trade(&trade, false);
                }
                OrderStatus::Filled => {
                    trade.filled_at = Some(Utc::now());
                    trade.execution_price = trade.average_price;
                    trade.calculate_slippage();
                    self.persist_trade(&trade);
                    info!(
                        trade_id,
                        symbol = %trade.symbol,
                        avg_price = ?trade.average_price,
                        slippage_pct = trade.slippage_pct,
                        "order filled"
                    );
                    self.publish_trade(&trade, true);
                    if let Err(e) = self.handle_fill(&trade).await {
                        error!(trade_id, error = %e, "fill handling failed");
                    }
                    return;
                }
                OrderStatus::Cancelled | OrderStatus::Rejected => {
                    self.persist_trade(&trade);
                    self.publish_trade(&trade, false);
                    info!(trade_id, status = %trade.status, "order reached terminal status");
                    return;
                }
                OrderStatus::Pending => {}
            }
        }
    }

    /// Entry fills open a position; exit fills realize PnL and complete the
    /// daily counters.
    async fn handle_fill(&self, trade: &Trade) -> Result<()> {
        let today = Utc::now().date_naive();

        // Exit leg: the position already points at this trade.
        if let Some(position) = self.store.get_position_by_exit_trade(trade.id)? {
            let exit_price = trade
                .average_price
                .or(trade.requested_price)
                .unwrap_or(position.entry_price);
            let pnl = realized_pnl(&position, exit_price, trade.filled_quantity);

            let mut closed_trade = trade.clone();
            closed_trade.pnl = pnl;
            let notional = position.entry_price * trade.filled_quantity;
            closed_trade.pnl_pct = if notional != 0.0 {
                pnl / notional * 100.0
            } else {
                0.0
            };
            self.persist_trade(&closed_trade);

            self.store.record_trade_result(today, pnl)?;
            info!(
                position_id = %position.id,
                symbol = %position.symbol,
                pnl,
                reason = ?position.close_reason,
                "position exit completed"
            );
            self.publish_position(&position);
            return Ok(());
        }

        // Entry leg: create the position unless one already exists.
        if self.store.get_position_by_entry_trade(trade.id)?.is_some() {
            return Ok(());
        }

        let entry_price = trade
            .average_price
            .or(trade.requested_price)
            .context("filled entry has no price")?;

        let atr = match self
            .client
            .get_klines(&trade.symbol, "1h", (ATR_PERIOD + 1) as u32)
            .await
        {
            Ok(bars) => crate::indicators::atr::calculate_atr(&bars, ATR_PERIOD),
            Err(e) => {
                warn!(symbol = %trade.symbol, error = %e, "ATR fetch failed — using fallback stop");
                None
            }
        };
        let initial_stop = self.risk.stop_loss_price(entry_price, trade.side, atr);
        let (stop, take_profit) = entry_targets(entry_price, initial_stop, trade.side);

        let position = Position::open(
            trade.id,
            &trade.symbol,
            trade.side,
            trade.filled_quantity,
            entry_price,
            stop,
            Some(take_profit),
        );
        self.store.insert_position(&position)?;
        self.store.record_trade_opened(today)?;

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            entry_price,
            stop,
            take_profit,
            "position opened from entry fill"
        );
        self.publish_position(&position);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Position monitoring (5 s cadence)
    // -------------------------------------------------------------------------

    /// One sweep over all open positions: refresh prices, advance trailing
    /// stops, and enqueue closes for stop/TP crossings.
    pub async fn monitor_positions(&self) {
        let open = match self.store.get_open_positions() {
            Ok(open) => open,
            Err(e) => {
                error!(error = %e, "open position query failed");
                return;
            }
        };
        if open.is_empty() {
            return;
        }

        // Gather prices once per symbol.
        let mut prices: HashMap<String, f64> = HashMap::new();
        for position in &open {
            if prices.contains_key(&position.symbol) {
                continue;
            }
            let price = match self.cache.get_price(&position.symbol) {
                Some(price) => Some(price),
                None => match self.client.get_ticker_price(&position.symbol).await {
                    Ok(price) => {
                        self.cache.set_price(&position.symbol, price);
                        Some(price)
                    }
                    Err(e) => {
                        warn!(symbol = %position.symbol, error = %e, "price fetch failed");
                        None
                    }
                },
            };
            if let Some(price) = price {
                prices.insert(position.symbol.clone(), price);
            }
        }

        for position in open {
            let Some(&price) = prices.get(&position.symbol) else {
                continue;
            };

            let exit_reason = {
                let lock = self.position_lock(&position.symbol);
                let _guard = lock.lock().await;

                // Reload under the lock: an exit may have raced us.
                let mut current = match self.store.get_position(&position.id) {
                    Ok(Some(p)) if p.status == PositionStatus::Open => p,
                    _ => continue,
                };

                self.risk.update_position_risk(&mut current, price);
                if let Err(e) = self.store.update_position(&current) {
                    warn!(position_id = %current.id, error = %e, "position update failed");
                }

                position_exit_reason(&current, price)
            };

            if let Some(reason) = exit_reason {
                self.enqueue(WorkItem::ClosePosition {
                    position_id: position.id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Position close
    // -------------------------------------------------------------------------

    /// Close an open position with a MARKET order opposite to the entry.
    /// Idempotent: a position that is already CLOSED is a no-op.
    pub async fn close_position(&self, position_id: &str, reason: &str) -> Result<()> {
        let preview = self
            .store
            .get_position(position_id)?
            .context("position not found")?;

        let lock = self.position_lock(&preview.symbol);
        let _guard = lock.lock().await;

        // Re-read under the lock; CLOSED means another worker won the race.
        let position = self
            .store
            .get_position(position_id)?
            .context("position not found")?;
        if position.status == PositionStatus::Closed {
            debug!(position_id, "close requested on CLOSED position — no-op");
            return Ok(());
        }

        let side = position.side.opposite();
        let quantity = self
            .client
            .format_quantity(&position.symbol, position.quantity)
            .await?;
        let expected_price = self.cache.get_price(&position.symbol);

        info!(
            position_id,
            symbol = %position.symbol,
            side = %side,
            quantity,
            reason,
            "closing position with market order"
        );

        let order = self
            .client
            .place_order(
                &position.symbol,
                side,
                OrderType::Market,
                quantity,
                None,
                None,
                None,
                None,
            )
            .await
            .context("exit order placement failed")?;

        let exchange_order_id = order["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .context("exit order response missing orderId")?;

        let mut exit_trade = Trade::pending(
            exchange_order_id,
            Uuid::new_v4().simple().to_string(),
            &position.symbol,
            side,
            OrderType::Market,
            quantity,
            None,
            expected_price,
        );
        exit_trade.macro_context = reason.to_string();
        exit_trade.id = self
            .store
            .insert_trade(&exit_trade)
            .context("failed to persist exit trade")?;

        // CLOSED on initiation; the exit trade's fill completes the record.
        let transitioned = self
            .store
            .close_position_if_open(position_id, exit_trade.id, reason)?;
        if !transitioned {
            warn!(position_id, "position closed concurrently despite lock");
        }

        if let Ok(Some(closed)) = self.store.get_position(position_id) {
            self.publish_position(&closed);
        }
        self.enqueue(WorkItem::MonitorOrder {
            trade_id: exit_trade.id,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fan-out helpers
    // -------------------------------------------------------------------------

    fn persist_trade(&self, trade: &Trade) {
        if let Err(e) = self.store.update_trade(trade) {
            error!(trade_id = trade.id, error = %e, "trade persist failed");
        }
    }

    fn publish_trade(&self, trade: &Trade, is_fill: bool) {
        let payload = match serde_json::to_value(trade) {
            Ok(v) => v,
            Err(_) => return,
        };
        let message = if is_fill {
            DashboardMessage::OrderFill { trade: payload }
        } else {
            DashboardMessage::TradeUpdate { trade: payload }
        };
        self.cache.publish(DASHBOARD_CHANNEL, &message);
    }

    fn publish_position(&self, position: &Position) {
        if let Ok(payload) = serde_json::to_value(position) {
            self.cache.publish(
                DASHBOARD_CHANNEL,
                &DashboardMessage::PositionUpdate { position: payload },
            );
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("client", &"<BinanceClient>")
            .finish()
    }
}

/// Dispatcher: one worker task per queued item, for the engine's lifetime.
async fn run_work_queue(engine: Arc<ExecutionEngine>, mut rx: mpsc::UnboundedReceiver<WorkItem>) {
    info!("execution work queue started");
    while let Some(item) = rx.recv().await {
        let engine = engine.clone();
        tokio::spawn(async move {
            match item {
                WorkItem::MonitorOrder { trade_id } => {
                    engine.monitor_order(trade_id).await;
                }
                WorkItem::ClosePosition {
                    position_id,
                    reason,
                } => {
                    if let Err(e) = engine.close_position(&position_id, &reason).await {
                        error!(position_id = %position_id, error = %e, "close failed");
                    }
                }
            }
        });
    }
    info!("execution work queue drained");
}

/// Route a valid signal: entries go through `execute_trade`, exits through
/// the idempotent `close_position` path on the symbol's open position.
pub async fn dispatch_signal(engine: &ExecutionEngine, signal: &TradeSignal) -> Result<()> {
    if signal.action == SignalAction::Hold || !signal.is_valid {
        return Ok(());
    }

    if signal.action.is_exit() {
        let Some(position) = engine.store.get_open_position(&signal.symbol)? else {
            debug!(symbol = %signal.symbol, "exit signal without open position — ignoring");
            return Ok(());
        };
        engine
            .close_position(&position.id, &signal.macro_context)
            .await
    } else {
        engine.execute_trade(signal).await.map(|_| ())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn pending_trade(side: Side, requested: f64) -> Trade {
        Trade::pending(
            "1001",
            "coid",
            "BTCUSDT",
            side,
            OrderType::Limit,
            requested,
            Some(100.0),
            Some(100.0),
        )
    }

    fn order_payload(status: &str, executed: &str, cum_quote: &str) -> serde_json::Value {
        serde_json::json!({
            "orderId": 1001,
            "status": status,
            "executedQty": executed,
            "cummulativeQuoteQty": cum_quote,
        })
    }

    // ---- apply_order_update ----------------------------------------------

    #[test]
    fn fill_quantity_is_monotone_and_capped() {
        let mut trade = pending_trade(Side::Buy, 1.0);

        apply_order_update(&mut trade, &order_payload("PARTIALLY_FILLED", "0.4", "40.0")).unwrap();
        assert!((trade.filled_quantity - 0.4).abs() < 1e-12);
        assert_eq!(trade.status, OrderStatus::PartiallyFilled);

        // A stale snapshot reporting less filled must not move us backwards.
        apply_order_update(&mut trade, &order_payload("PARTIALLY_FILLED", "0.2", "20.0")).unwrap();
        assert!((trade.filled_quantity - 0.4).abs() < 1e-12);

        // Exchange over-report is capped at the requested quantity.
        apply_order_update(&mut trade, &order_payload("FILLED", "1.5", "150.0")).unwrap();
        assert!((trade.filled_quantity - 1.0).abs() < 1e-12);
        assert!(trade.filled_quantity <= trade.requested_quantity);
    }

    #[test]
    fn average_price_from_cumulative_quote() {
        let mut trade = pending_trade(Side::Buy, 1.0);
        apply_order_update(&mut trade, &order_payload("FILLED", "1.0", "100.5")).unwrap();
        assert!((trade.average_price.unwrap() - 100.5).abs() < 1e-12);

        trade.calculate_slippage();
        assert!((trade.slippage - 0.5).abs() < 1e-12);
        assert!((trade.slippage_pct - 0.5).abs() < 1e-12);
    }

    #[test]
    fn terminal_status_is_absorbing() {
        let mut trade = pending_trade(Side::Buy, 1.0);
        apply_order_update(&mut trade, &order_payload("CANCELED", "0.0", "0.0")).unwrap();
        assert_eq!(trade.status, OrderStatus::Cancelled);

        // A late contradictory snapshot cannot resurrect the order.
        apply_order_update(&mut trade, &order_payload("NEW", "0.0", "0.0")).unwrap();
        assert_eq!(trade.status, OrderStatus::Cancelled);
    }

    #[test]
    fn missing_status_is_an_error() {
        let mut trade = pending_trade(Side::Buy, 1.0);
        let payload = serde_json::json!({"executedQty": "0.5"});
        assert!(apply_order_update(&mut trade, &payload).is_err());
    }

    // ---- realized PnL ------------------------------------------------------

    #[test]
    fn realized_pnl_by_side() {
        let long = Position::open(1, "BTCUSDT", Side::Buy, 2.0, 100.0, 98.0, None);
        assert!((realized_pnl(&long, 105.0, 2.0) - 10.0).abs() < 1e-12);
        assert!((realized_pnl(&long, 95.0, 2.0) + 10.0).abs() < 1e-12);

        let short = Position::open(1, "ETHUSDT", Side::Sell, 2.0, 100.0, 102.0, None);
        assert!((realized_pnl(&short, 95.0, 2.0) - 10.0).abs() < 1e-12);
        assert!((realized_pnl(&short, 105.0, 2.0) + 10.0).abs() < 1e-12);
    }

    // ---- entry targets -----------------------------------------------------

    #[test]
    fn take_profit_is_two_to_one() {
        let (stop, tp) = entry_targets(100.0, 98.0, Side::Buy);
        assert!((stop - 98.0).abs() < 1e-12);
        assert!((tp - 104.0).abs() < 1e-12);

        let (stop, tp) = entry_targets(100.0, 102.0, Side::Sell);
        assert!((stop - 102.0).abs() < 1e-12);
        assert!((tp - 96.0).abs() < 1e-12);
    }

    // ---- exit reasons ------------------------------------------------------

    #[test]
    fn exit_reasons_per_side() {
        let long = Position::open(1, "BTCUSDT", Side::Buy, 1.0, 100.0, 98.0, Some(104.0));
        assert_eq!(position_exit_reason(&long, 99.0), None);
        assert_eq!(position_exit_reason(&long, 98.0), Some("STOP_LOSS"));
        assert_eq!(position_exit_reason(&long, 104.0), Some("TAKE_PROFIT"));

        let short = Position::open(1, "ETHUSDT", Side::Sell, 1.0, 100.0, 102.0, Some(96.0));
        assert_eq!(position_exit_reason(&short, 101.0), None);
        assert_eq!(position_exit_reason(&short, 102.0), Some("STOP_LOSS"));
        assert_eq!(position_exit_reason(&short, 96.0), Some("TAKE_PROFIT"));
    }
}
