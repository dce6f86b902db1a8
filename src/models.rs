// =============================================================================
// Durable entities — trades, positions, daily risk state, macro events
// =============================================================================
//
// These rows are owned by the SQLite store; everything here is plain data
// plus the small state machine each entity carries:
//
//   Trade     — order lifecycle + slippage accounting
//   Position  — unrealized PnL + trailing-stop ratchet
//   RiskState — one row per UTC day, drives the circuit breaker
//   EconomicEvent — macro calendar rows consumed by the 3-D analyzer
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, OrderType, Side, SystemStatus};

// =============================================================================
// Trade
// =============================================================================

/// One exchange order with its execution and strategy context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Store row id (0 until inserted).
    pub id: i64,
    /// Exchange order id — unique per venue.
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,

    pub requested_quantity: f64,
    /// Monotonically non-decreasing as fills arrive.
    pub filled_quantity: f64,

    pub requested_price: Option<f64>,
    pub execution_price: Option<f64>,
    pub average_price: Option<f64>,

    /// Best price observed when the order was sized — slippage baseline.
    pub expected_price: Option<f64>,
    pub slippage: f64,
    pub slippage_pct: f64,

    pub pnl: f64,
    pub pnl_pct: f64,
    pub commission: f64,

    // Strategy context captured at signal time.
    pub macro_context: String,
    pub vpa_pattern: String,
    pub three_d_signal: String,
    pub ema_deviation: Option<f64>,

    pub status: OrderStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// A fresh PENDING trade as persisted right after order placement.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        exchange_order_id: impl Into<String>,
        client_order_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        order_type: OrderType,
        requested_quantity: f64,
        requested_price: Option<f64>,
        expected_price: Option<f64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            exchange_order_id: exchange_order_id.into(),
            client_order_id: client_order_id.into(),
            symbol: symbol.into(),
            side,
            order_type,
            requested_quantity,
            filled_quantity: 0.0,
            requested_price,
            execution_price: None,
            average_price: None,
            expected_price,
            slippage: 0.0,
            slippage_pct: 0.0,
            pnl: 0.0,
            pnl_pct: 0.0,
            commission: 0.0,
            macro_context: String::new(),
            vpa_pattern: String::new(),
            three_d_signal: String::new(),
            ema_deviation: None,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
            filled_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Recompute slippage once both the expected and average prices are known.
    ///
    /// slippage = average − expected; slippage % relative to expected.
    pub fn calculate_slippage(&mut self) {
        if let (Some(expected), Some(average)) = (self.expected_price, self.average_price) {
            if expected != 0.0 {
                self.slippage = average - expected;
                self.slippage_pct = (self.slippage / expected) * 100.0;
            }
        }
    }
}

// =============================================================================
// Position
// =============================================================================

/// Open/closed state of a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A position created from a filled entry trade, carrying the trailing-stop
/// state machine. References its trades by id only; reverse traversal is a
/// store query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// UUID v4.
    pub id: String,
    pub entry_trade_id: i64,
    pub exit_trade_id: Option<i64>,

    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,

    pub current_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,

    pub initial_stop: f64,
    pub current_stop: f64,
    pub trailing_activated: bool,
    /// Frozen at activation time: |price − current_stop| at that instant.
    pub trailing_distance: Option<f64>,
    /// Highest price seen since activation (longs).
    pub highest_price: Option<f64>,
    /// Lowest price seen since activation (shorts).
    pub lowest_price: Option<f64>,

    pub take_profit: Option<f64>,

    pub status: PositionStatus,
    pub close_reason: Option<String>,

    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn open(
        entry_trade_id: i64,
        symbol: impl Into<String>,
        side: Side,
        quantity: f64,
        entry_price: f64,
        initial_stop: f64,
        take_profit: Option<f64>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entry_trade_id,
            exit_trade_id: None,
            symbol: symbol.into(),
            side,
            quantity,
            entry_price,
            current_price: Some(entry_price),
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            initial_stop,
            current_stop: initial_stop,
            trailing_activated: false,
            trailing_distance: None,
            highest_price: None,
            lowest_price: None,
            take_profit,
            status: PositionStatus::Open,
            close_reason: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    /// Recompute unrealized PnL from the latest price.
    pub fn update_unrealized_pnl(&mut self, current_price: f64) {
        self.current_price = Some(current_price);
        self.unrealized_pnl = match self.side {
            Side::Buy => (current_price - self.entry_price) * self.quantity,
            Side::Sell => (self.entry_price - current_price) * self.quantity,
        };
        let notional = self.entry_price * self.quantity;
        self.unrealized_pnl_pct = if notional != 0.0 {
            (self.unrealized_pnl / notional) * 100.0
        } else {
            0.0
        };
    }

    /// Advance the trailing-stop state machine.
    ///
    /// Activation: once unrealized profit reaches `trailing_trigger_pct`
    /// (a fraction, e.g. 0.02), the trailing distance is frozen at
    /// |price − current_stop| and the favorable-extreme tracker starts.
    ///
    /// After activation the stop only ever ratchets toward profit:
    /// longs `max(stop, highest − distance)`, shorts
    /// `min(stop, lowest + distance)`.
    pub fn update_trailing_stop(&mut self, current_price: f64, trailing_trigger_pct: f64) {
        if !self.trailing_activated && self.unrealized_pnl_pct >= trailing_trigger_pct * 100.0 {
            self.trailing_activated = true;
            self.trailing_distance = Some((current_price - self.current_stop).abs());
            match self.side {
                Side::Buy => self.highest_price = Some(current_price),
                Side::Sell => self.lowest_price = Some(current_price),
            }
        }

        if !self.trailing_activated {
            return;
        }
        let Some(distance) = self.trailing_distance else {
            return;
        };

        match self.side {
            Side::Buy => {
                if current_price > self.highest_price.unwrap_or(f64::MIN) {
                    self.highest_price = Some(current_price);
                    let new_stop = current_price - distance;
                    if new_stop > self.current_stop {
                        self.current_stop = new_stop;
                    }
                }
            }
            Side::Sell => {
                if self.lowest_price.map_or(true, |low| current_price < low) {
                    self.lowest_price = Some(current_price);
                    let new_stop = current_price + distance;
                    if new_stop < self.current_stop {
                        self.current_stop = new_stop;
                    }
                }
            }
        }
    }

    /// Stop condition: long exits at or below the stop, short at or above.
    pub fn is_stop_hit(&self, current_price: f64) -> bool {
        match self.side {
            Side::Buy => current_price <= self.current_stop,
            Side::Sell => current_price >= self.current_stop,
        }
    }

    /// Take-profit condition for the position's side, if a target is set.
    pub fn is_take_profit_hit(&self, current_price: f64) -> bool {
        match (self.take_profit, self.side) {
            (Some(tp), Side::Buy) => current_price >= tp,
            (Some(tp), Side::Sell) => current_price <= tp,
            (None, _) => false,
        }
    }
}

// =============================================================================
// RiskState
// =============================================================================

/// Daily risk ledger — one row per UTC calendar day, created lazily on first
/// access. The circuit breaker reads/writes this row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub date: NaiveDate,

    pub starting_balance: f64,
    pub current_balance: f64,
    /// Daily high-water mark; never decreases within a day.
    pub highest_balance: f64,

    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,

    pub drawdown: f64,
    pub drawdown_pct: f64,
    pub max_drawdown_pct: f64,

    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,

    pub system_status: SystemStatus,
    pub pause_reason: String,
    pub paused_at: Option<DateTime<Utc>>,
}

impl RiskState {
    pub fn new(date: NaiveDate, starting_balance: f64) -> Self {
        Self {
            date,
            starting_balance,
            current_balance: starting_balance,
            highest_balance: starting_balance,
            daily_pnl: 0.0,
            daily_pnl_pct: 0.0,
            drawdown: 0.0,
            drawdown_pct: 0.0,
            max_drawdown_pct: 0.0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            system_status: SystemStatus::Active,
            pause_reason: String::new(),
            paused_at: None,
        }
    }

    /// Fold a fresh balance observation into the daily ledger.
    pub fn update_balance(&mut self, new_balance: f64) {
        self.current_balance = new_balance;

        if new_balance > self.highest_balance {
            self.highest_balance = new_balance;
        }

        self.daily_pnl = new_balance - self.starting_balance;
        self.daily_pnl_pct = if self.starting_balance > 0.0 {
            (self.daily_pnl / self.starting_balance) * 100.0
        } else {
            0.0
        };

        self.drawdown = self.highest_balance - new_balance;
        self.drawdown_pct = if self.highest_balance > 0.0 {
            (self.drawdown / self.highest_balance) * 100.0
        } else {
            0.0
        };

        if self.drawdown_pct > self.max_drawdown_pct {
            self.max_drawdown_pct = self.drawdown_pct;
        }
    }

    /// Pause trading for the rest of the day.
    pub fn trigger_circuit_breaker(&mut self, reason: impl Into<String>) {
        self.system_status = SystemStatus::Paused;
        self.pause_reason = reason.into();
        self.paused_at = Some(Utc::now());
    }
}

// =============================================================================
// EconomicEvent
// =============================================================================

/// Macro event category tracked by the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Cpi,
    Ppi,
    Nfp,
    Fomc,
    Gdp,
    Other,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpi => "CPI",
            Self::Ppi => "PPI",
            Self::Nfp => "NFP",
            Self::Fomc => "FOMC",
            Self::Gdp => "GDP",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "CPI" => Self::Cpi,
            "PPI" => Self::Ppi,
            "NFP" => Self::Nfp,
            "FOMC" => Self::Fomc,
            "GDP" => Self::Gdp,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Market impact class assigned by the calendar source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventImpact {
    Low,
    Medium,
    High,
}

impl EventImpact {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "HIGH" => Self::High,
            "LOW" => Self::Low,
            _ => Self::Medium,
        }
    }
}

impl std::fmt::Display for EventImpact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled or released macro-economic figure (CPI, NFP, ...).
/// Unique per (event_type, country, release_time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicEvent {
    pub id: i64,
    pub event_type: EventType,
    pub country: String,
    pub title: String,
    pub release_time: DateTime<Utc>,
    pub forecast: Option<f64>,
    pub actual: Option<f64>,
    pub previous: Option<f64>,
    pub impact: EventImpact,
    pub deviation_from_forecast: Option<f64>,
    pub source: String,
    pub external_id: String,
}

impl EconomicEvent {
    /// Surprise relative to forecast, as a percentage of |forecast|.
    /// Only defined once both figures exist and the forecast is non-zero.
    pub fn calculate_deviation(&mut self) {
        if let (Some(actual), Some(forecast)) = (self.actual, self.forecast) {
            if forecast != 0.0 {
                self.deviation_from_forecast = Some(((actual - forecast) / forecast.abs()) * 100.0);
            }
        }
    }
}
