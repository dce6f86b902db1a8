// =============================================================================
// Durable Store — SQLite audit trail for trades, positions, risk state
// =============================================================================
//
// Source of truth for every durable entity; the market cache is only a fast
// path on top of it. Writes happen store-first, cache-second.
//
// Concurrency: a single `rusqlite::Connection` behind a `parking_lot::Mutex`.
// All operations are short single-statement transactions, so per-entity
// updates are linearizable through the lock. The OPEN -> CLOSED position
// transition is a conditional UPDATE so that two workers racing to close the
// same position produce exactly one exit.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::market_data::{Candle, CandleKey};
use crate::models::{
    EconomicEvent, EventImpact, EventType, Position, PositionStatus, RiskState, Trade,
};
use crate::types::{OrderStatus, OrderType, Side, SystemStatus};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path` and ensure the schema exists.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite store at {path}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        info!(path, "store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange_order_id TEXT NOT NULL UNIQUE,
                client_order_id TEXT NOT NULL DEFAULT '',
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                requested_quantity REAL NOT NULL,
                filled_quantity REAL NOT NULL DEFAULT 0,
                requested_price REAL,
                execution_price REAL,
                average_price REAL,
                expected_price REAL,
                slippage REAL NOT NULL DEFAULT 0,
                slippage_pct REAL NOT NULL DEFAULT 0,
                pnl REAL NOT NULL DEFAULT 0,
                pnl_pct REAL NOT NULL DEFAULT 0,
                commission REAL NOT NULL DEFAULT 0,
                macro_context TEXT NOT NULL DEFAULT '',
                vpa_pattern TEXT NOT NULL DEFAULT '',
                three_d_signal TEXT NOT NULL DEFAULT '',
                ema_deviation REAL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                filled_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_symbol_status
                ON trades(symbol, status);
            CREATE INDEX IF NOT EXISTS idx_trades_created_at
                ON trades(created_at);

            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                entry_trade_id INTEGER NOT NULL REFERENCES trades(id),
                exit_trade_id INTEGER REFERENCES trades(id),
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                current_price REAL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                unrealized_pnl_pct REAL NOT NULL DEFAULT 0,
                initial_stop REAL NOT NULL,
                current_stop REAL NOT NULL,
                trailing_activated INTEGER NOT NULL DEFAULT 0,
                trailing_distance REAL,
                highest_price REAL,
                lowest_price REAL,
                take_profit REAL,
                status TEXT NOT NULL,
                close_reason TEXT,
                opened_at TEXT NOT NULL,
                closed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_symbol_status
                ON positions(symbol, status);

            CREATE TABLE IF NOT EXISTS risk_states (
                date TEXT PRIMARY KEY,
                starting_balance REAL NOT NULL,
                current_balance REAL NOT NULL,
                highest_balance REAL NOT NULL,
                daily_pnl REAL NOT NULL DEFAULT 0,
                daily_pnl_pct REAL NOT NULL DEFAULT 0,
                drawdown REAL NOT NULL DEFAULT 0,
                drawdown_pct REAL NOT NULL DEFAULT 0,
                max_drawdown_pct REAL NOT NULL DEFAULT 0,
                total_trades INTEGER NOT NULL DEFAULT 0,
                winning_trades INTEGER NOT NULL DEFAULT 0,
                losing_trades INTEGER NOT NULL DEFAULT 0,
                system_status TEXT NOT NULL DEFAULT 'ACTIVE',
                pause_reason TEXT NOT NULL DEFAULT '',
                paused_at TEXT
            );

            CREATE TABLE IF NOT EXISTS economic_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                country TEXT NOT NULL DEFAULT 'US',
                title TEXT NOT NULL DEFAULT '',
                release_time TEXT NOT NULL,
                forecast REAL,
                actual REAL,
                previous REAL,
                impact TEXT NOT NULL DEFAULT 'MEDIUM',
                deviation_from_forecast REAL,
                source TEXT NOT NULL DEFAULT '',
                external_id TEXT NOT NULL DEFAULT '',
                UNIQUE(event_type, country, release_time)
            );
            CREATE INDEX IF NOT EXISTS idx_events_release_time
                ON economic_events(release_time);

            CREATE TABLE IF NOT EXISTS market_data (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                spread REAL NOT NULL,
                body REAL NOT NULL,
                upper_wick REAL NOT NULL,
                lower_wick REAL NOT NULL,
                close_position REAL NOT NULL,
                UNIQUE(symbol, timeframe, open_time)
            );
            CREATE INDEX IF NOT EXISTS idx_market_data_series
                ON market_data(symbol, timeframe, open_time);
            COMMIT;",
        )?;
        Ok(())
    }

    /// Cheap availability probe, used before order placement: an order must
    /// never be sent if its trade row cannot be persisted afterwards.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |_| Ok(()))
            .context("store ping failed")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Insert a new trade row; returns the assigned row id.
    pub fn insert_trade(&self, trade: &Trade) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (
                exchange_order_id, client_order_id, symbol, side, order_type,
                requested_quantity, filled_quantity, requested_price,
                execution_price, average_price, expected_price,
                slippage, slippage_pct, pnl, pnl_pct, commission,
                macro_context, vpa_pattern, three_d_signal, ema_deviation,
                status, created_at, updated_at, filled_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                      ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                trade.exchange_order_id,
                trade.client_order_id,
                trade.symbol,
                trade.side.as_str(),
                trade.order_type.as_str(),
                trade.requested_quantity,
                trade.filled_quantity,
                trade.requested_price,
                trade.execution_price,
                trade.average_price,
                trade.expected_price,
                trade.slippage,
                trade.slippage_pct,
                trade.pnl,
                trade.pnl_pct,
                trade.commission,
                trade.macro_context,
                trade.vpa_pattern,
                trade.three_d_signal,
                trade.ema_deviation,
                trade.status.as_str(),
                trade.created_at.to_rfc3339(),
                trade.updated_at.to_rfc3339(),
                trade.filled_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("failed to insert trade")?;
        Ok(conn.last_insert_rowid())
    }

    /// Write back every mutable field of an existing trade row.
    pub fn update_trade(&self, trade: &Trade) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE trades SET
                    filled_quantity = ?2, execution_price = ?3, average_price = ?4,
                    slippage = ?5, slippage_pct = ?6, pnl = ?7, pnl_pct = ?8,
                    commission = ?9, status = ?10, updated_at = ?11, filled_at = ?12
                 WHERE id = ?1",
                params![
                    trade.id,
                    trade.filled_quantity,
                    trade.execution_price,
                    trade.average_price,
                    trade.slippage,
                    trade.slippage_pct,
                    trade.pnl,
                    trade.pnl_pct,
                    trade.commission,
                    trade.status.as_str(),
                    Utc::now().to_rfc3339(),
                    trade.filled_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("failed to update trade")?;
        Ok(())
    }

    pub fn get_trade(&self, id: i64) -> Result<Option<Trade>> {
        self.conn
            .lock()
            .query_row(
                &format!("{TRADE_SELECT} WHERE id = ?1"),
                params![id],
                trade_from_row,
            )
            .optional()
            .context("failed to load trade")
    }

    pub fn get_trade_by_exchange_id(&self, exchange_order_id: &str) -> Result<Option<Trade>> {
        self.conn
            .lock()
            .query_row(
                &format!("{TRADE_SELECT} WHERE exchange_order_id = ?1"),
                params![exchange_order_id],
                trade_from_row,
            )
            .optional()
            .context("failed to load trade by exchange id")
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub fn insert_position(&self, pos: &Position) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO positions (
                    id, entry_trade_id, exit_trade_id, symbol, side, quantity,
                    entry_price, current_price, unrealized_pnl, unrealized_pnl_pct,
                    initial_stop, current_stop, trailing_activated, trailing_distance,
                    highest_price, lowest_price, take_profit, status, close_reason,
                    opened_at, closed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                          ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    pos.id,
                    pos.entry_trade_id,
                    pos.exit_trade_id,
                    pos.symbol,
                    pos.side.as_str(),
                    pos.quantity,
                    pos.entry_price,
                    pos.current_price,
                    pos.unrealized_pnl,
                    pos.unrealized_pnl_pct,
                    pos.initial_stop,
                    pos.current_stop,
                    pos.trailing_activated as i64,
                    pos.trailing_distance,
                    pos.highest_price,
                    pos.lowest_price,
                    pos.take_profit,
                    pos.status.as_str(),
                    pos.close_reason,
                    pos.opened_at.to_rfc3339(),
                    pos.closed_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("failed to insert position")?;
        Ok(())
    }

    /// Persist the mutable tracking fields (price, PnL, trailing state).
    pub fn update_position(&self, pos: &Position) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE positions SET
                    current_price = ?2, unrealized_pnl = ?3, unrealized_pnl_pct = ?4,
                    current_stop = ?5, trailing_activated = ?6, trailing_distance = ?7,
                    highest_price = ?8, lowest_price = ?9
                 WHERE id = ?1",
                params![
                    pos.id,
                    pos.current_price,
                    pos.unrealized_pnl,
                    pos.unrealized_pnl_pct,
                    pos.current_stop,
                    pos.trailing_activated as i64,
                    pos.trailing_distance,
                    pos.highest_price,
                    pos.lowest_price,
                ],
            )
            .context("failed to update position")?;
        Ok(())
    }

    /// Flip a position to CLOSED, but only if it is still OPEN.
    ///
    /// Returns `true` when this call performed the transition. A second
    /// close attempt sees zero affected rows and returns `false`, which is
    /// what makes `close_position` idempotent under racing workers.
    pub fn close_position_if_open(
        &self,
        position_id: &str,
        exit_trade_id: i64,
        reason: &str,
    ) -> Result<bool> {
        let affected = self
            .conn
            .lock()
            .execute(
                "UPDATE positions SET
                    status = 'CLOSED', exit_trade_id = ?2, close_reason = ?3, closed_at = ?4
                 WHERE id = ?1 AND status = 'OPEN'",
                params![position_id, exit_trade_id, reason, Utc::now().to_rfc3339()],
            )
            .context("failed to close position")?;
        debug!(position_id, reason, transitioned = (affected == 1), "close_position_if_open");
        Ok(affected == 1)
    }

    pub fn get_position(&self, id: &str) -> Result<Option<Position>> {
        self.conn
            .lock()
            .query_row(
                &format!("{POSITION_SELECT} WHERE id = ?1"),
                params![id],
                position_from_row,
            )
            .optional()
            .context("failed to load position")
    }

    /// The position opened by a given entry trade, if one exists.
    pub fn get_position_by_entry_trade(&self, trade_id: i64) -> Result<Option<Position>> {
        self.conn
            .lock()
            .query_row(
                &format!("{POSITION_SELECT} WHERE entry_trade_id = ?1"),
                params![trade_id],
                position_from_row,
            )
            .optional()
            .context("failed to load position by entry trade")
    }

    /// The position being closed by a given exit trade, if one exists.
    pub fn get_position_by_exit_trade(&self, trade_id: i64) -> Result<Option<Position>> {
        self.conn
            .lock()
            .query_row(
                &format!("{POSITION_SELECT} WHERE exit_trade_id = ?1"),
                params![trade_id],
                position_from_row,
            )
            .optional()
            .context("failed to load position by exit trade")
    }

    /// The single OPEN position on a symbol, if any.
    pub fn get_open_position(&self, symbol: &str) -> Result<Option<Position>> {
        self.conn
            .lock()
            .query_row(
                &format!("{POSITION_SELECT} WHERE symbol = ?1 AND status = 'OPEN' ORDER BY opened_at DESC LIMIT 1"),
                params![symbol],
                position_from_row,
            )
            .optional()
            .context("failed to load open position")
    }

    pub fn get_open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{POSITION_SELECT} WHERE status = 'OPEN' ORDER BY opened_at"))?;
        let rows = stmt.query_map([], position_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Risk state
    // -------------------------------------------------------------------------

    /// Read a day's risk state without creating it.
    pub fn get_risk_state(&self, date: NaiveDate) -> Result<Option<RiskState>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        self.conn
            .lock()
            .query_row(
                &format!("{RISK_SELECT} WHERE date = ?1"),
                params![date_str],
                risk_state_from_row,
            )
            .optional()
            .context("failed to load risk state")
    }

    /// Load today's risk state, creating it lazily on the first access of a
    /// new UTC date with `starting_balance` seeding all balance fields.
    pub fn get_or_create_risk_state(
        &self,
        date: NaiveDate,
        starting_balance: f64,
    ) -> Result<RiskState> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let conn = self.conn.lock();

        let existing = conn
            .query_row(
                &format!("{RISK_SELECT} WHERE date = ?1"),
                params![date_str],
                risk_state_from_row,
            )
            .optional()?;

        if let Some(state) = existing {
            return Ok(state);
        }

        let state = RiskState::new(date, starting_balance);
        conn.execute(
            "INSERT INTO risk_states (date, starting_balance, current_balance, highest_balance)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                date_str,
                state.starting_balance,
                state.current_balance,
                state.highest_balance
            ],
        )
        .context("failed to create risk state")?;
        info!(date = %date_str, starting_balance, "risk state created for new day");
        Ok(state)
    }

    pub fn update_risk_state(&self, state: &RiskState) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE risk_states SET
                    current_balance = ?2, highest_balance = ?3, daily_pnl = ?4,
                    daily_pnl_pct = ?5, drawdown = ?6, drawdown_pct = ?7,
                    max_drawdown_pct = ?8, total_trades = ?9, winning_trades = ?10,
                    losing_trades = ?11, system_status = ?12, pause_reason = ?13,
                    paused_at = ?14
                 WHERE date = ?1",
                params![
                    state.date.format("%Y-%m-%d").to_string(),
                    state.current_balance,
                    state.highest_balance,
                    state.daily_pnl,
                    state.daily_pnl_pct,
                    state.drawdown,
                    state.drawdown_pct,
                    state.max_drawdown_pct,
                    state.total_trades,
                    state.winning_trades,
                    state.losing_trades,
                    state.system_status.as_str(),
                    state.pause_reason,
                    state.paused_at.map(|t| t.to_rfc3339()),
                ],
            )
            .context("failed to update risk state")?;
        Ok(())
    }

    /// Bump today's total-trades counter (entry fill).
    pub fn record_trade_opened(&self, date: NaiveDate) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE risk_states SET total_trades = total_trades + 1 WHERE date = ?1",
                params![date.format("%Y-%m-%d").to_string()],
            )
            .context("failed to record trade open")?;
        Ok(())
    }

    /// Record a realized trade outcome (exit fill) in the daily counters.
    pub fn record_trade_result(&self, date: NaiveDate, pnl: f64) -> Result<()> {
        let column = if pnl >= 0.0 {
            "winning_trades"
        } else {
            "losing_trades"
        };
        self.conn
            .lock()
            .execute(
                &format!("UPDATE risk_states SET {column} = {column} + 1 WHERE date = ?1"),
                params![date.format("%Y-%m-%d").to_string()],
            )
            .context("failed to record trade result")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Economic events
    // -------------------------------------------------------------------------

    /// Insert or refresh an event; uniqueness is (type, country, release_time).
    pub fn upsert_event(&self, event: &EconomicEvent) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO economic_events (
                    event_type, country, title, release_time, forecast, actual,
                    previous, impact, deviation_from_forecast, source, external_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(event_type, country, release_time) DO UPDATE SET
                    title = excluded.title,
                    forecast = excluded.forecast,
                    actual = excluded.actual,
                    previous = excluded.previous,
                    impact = excluded.impact,
                    deviation_from_forecast = excluded.deviation_from_forecast,
                    source = excluded.source,
                    external_id = excluded.external_id",
                params![
                    event.event_type.as_str(),
                    event.country,
                    event.title,
                    event.release_time.to_rfc3339(),
                    event.forecast,
                    event.actual,
                    event.previous,
                    event.impact.as_str(),
                    event.deviation_from_forecast,
                    event.source,
                    event.external_id,
                ],
            )
            .context("failed to upsert economic event")?;
        Ok(())
    }

    /// HIGH/MEDIUM events releasing in (now, now + 24h], soonest first.
    pub fn upcoming_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EconomicEvent>> {
        let until = now + chrono::Duration::hours(24);
        self.query_events(
            "release_time > ?1 AND release_time <= ?2 ORDER BY release_time ASC",
            now,
            until,
            limit,
        )
    }

    /// HIGH/MEDIUM events released in [now − 2h, now), most recent first.
    pub fn recent_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EconomicEvent>> {
        let since = now - chrono::Duration::hours(2);
        self.query_events(
            "release_time >= ?1 AND release_time < ?2 ORDER BY release_time DESC",
            since,
            now,
            limit,
        )
    }

    fn query_events(
        &self,
        clause: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EconomicEvent>> {
        let conn = self.conn.lock();
        let sql = format!(
            "{EVENT_SELECT} WHERE impact IN ('HIGH', 'MEDIUM') AND {clause} LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![from.to_rfc3339(), to.to_rfc3339()], event_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Market data (closed bars)
    // -------------------------------------------------------------------------

    /// Persist a closed bar with its derived geometry. Duplicate open times
    /// are ignored: closed candles are immutable.
    pub fn insert_candle(&self, key: &CandleKey, candle: &Candle) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO market_data (
                    symbol, timeframe, open_time, close_time, open, high, low,
                    close, volume, spread, body, upper_wick, lower_wick,
                    close_position
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    key.symbol,
                    key.interval,
                    candle.open_time,
                    candle.close_time,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    candle.spread(),
                    candle.body(),
                    candle.upper_wick(),
                    candle.lower_wick(),
                    candle.close_position(),
                ],
            )
            .context("failed to insert candle")?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

// -----------------------------------------------------------------------------
// Row mapping
// -----------------------------------------------------------------------------

const TRADE_SELECT: &str = "SELECT id, exchange_order_id, client_order_id, symbol, side, \
    order_type, requested_quantity, filled_quantity, requested_price, execution_price, \
    average_price, expected_price, slippage, slippage_pct, pnl, pnl_pct, commission, \
    macro_context, vpa_pattern, three_d_signal, ema_deviation, status, created_at, \
    updated_at, filled_at FROM trades";

const POSITION_SELECT: &str = "SELECT id, entry_trade_id, exit_trade_id, symbol, side, \
    quantity, entry_price, current_price, unrealized_pnl, unrealized_pnl_pct, initial_stop, \
    current_stop, trailing_activated, trailing_distance, highest_price, lowest_price, \
    take_profit, status, close_reason, opened_at, closed_at FROM positions";

const RISK_SELECT: &str = "SELECT date, starting_balance, current_balance, highest_balance, \
    daily_pnl, daily_pnl_pct, drawdown, drawdown_pct, max_drawdown_pct, total_trades, \
    winning_trades, losing_trades, system_status, pause_reason, paused_at FROM risk_states";

const EVENT_SELECT: &str = "SELECT id, event_type, country, title, release_time, forecast, \
    actual, previous, impact, deviation_from_forecast, source, external_id FROM economic_events";

fn parse_datetime(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: row.get(0)?,
        exchange_order_id: row.get(1)?,
        client_order_id: row.get(2)?,
        symbol: row.get(3)?,
        side: Side::parse(&row.get::<_, String>(4)?).unwrap_or(Side::Buy),
        order_type: OrderType::parse(&row.get::<_, String>(5)?).unwrap_or(OrderType::Limit),
        requested_quantity: row.get(6)?,
        filled_quantity: row.get(7)?,
        requested_price: row.get(8)?,
        execution_price: row.get(9)?,
        average_price: row.get(10)?,
        expected_price: row.get(11)?,
        slippage: row.get(12)?,
        slippage_pct: row.get(13)?,
        pnl: row.get(14)?,
        pnl_pct: row.get(15)?,
        commission: row.get(16)?,
        macro_context: row.get(17)?,
        vpa_pattern: row.get(18)?,
        three_d_signal: row.get(19)?,
        ema_deviation: row.get(20)?,
        status: OrderStatus::parse(&row.get::<_, String>(21)?).unwrap_or(OrderStatus::Pending),
        created_at: parse_datetime(row.get(22)?),
        updated_at: parse_datetime(row.get(23)?),
        filled_at: row.get::<_, Option<String>>(24)?.map(parse_datetime),
    })
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: row.get(0)?,
        entry_trade_id: row.get(1)?,
        exit_trade_id: row.get(2)?,
        symbol: row.get(3)?,
        side: Side::parse(&row.get::<_, String>(4)?).unwrap_or(Side::Buy),
        quantity: row.get(5)?,
        entry_price: row.get(6)?,
        current_price: row.get(7)?,
        unrealized_pnl: row.get(8)?,
        unrealized_pnl_pct: row.get(9)?,
        initial_stop: row.get(10)?,
        current_stop: row.get(11)?,
        trailing_activated: row.get::<_, i64>(12)? != 0,
        trailing_distance: row.get(13)?,
        highest_price: row.get(14)?,
        lowest_price: row.get(15)?,
        take_profit: row.get(16)?,
        status: PositionStatus::parse(&row.get::<_, String>(17)?).unwrap_or(PositionStatus::Open),
        close_reason: row.get(18)?,
        opened_at: parse_datetime(row.get(19)?),
        closed_at: row.get::<_, Option<String>>(20)?.map(parse_datetime),
    })
}

fn risk_state_from_row(row: &Row<'_>) -> rusqlite::Result<RiskState> {
    let date_str: String = row.get(0)?;
    Ok(RiskState {
        date: NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").unwrap_or_default(),
        starting_balance: row.get(1)?,
        current_balance: row.get(2)?,
        highest_balance: row.get(3)?,
        daily_pnl: row.get(4)?,
        daily_pnl_pct: row.get(5)?,
        drawdown: row.get(6)?,
        drawdown_pct: row.get(7)?,
        max_drawdown_pct: row.get(8)?,
        total_trades: row.get(9)?,
        winning_trades: row.get(10)?,
        losing_trades: row.get(11)?,
        system_status: SystemStatus::parse(&row.get::<_, String>(12)?)
            .unwrap_or(SystemStatus::Active),
        pause_reason: row.get(13)?,
        paused_at: row.get::<_, Option<String>>(14)?.map(parse_datetime),
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EconomicEvent> {
    Ok(EconomicEvent {
        id: row.get(0)?,
        event_type: EventType::parse(&row.get::<_, String>(1)?),
        country: row.get(2)?,
        title: row.get(3)?,
        release_time: parse_datetime(row.get(4)?),
        forecast: row.get(5)?,
        actual: row.get(6)?,
        previous: row.get(7)?,
        impact: EventImpact::parse(&row.get::<_, String>(8)?),
        deviation_from_forecast: row.get(9)?,
        source: row.get(10)?,
        external_id: row.get(11)?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn sample_trade(order_id: &str) -> Trade {
        Trade::pending(
            order_id,
            "client-1",
            "BTCUSDT",
            Side::Buy,
            OrderType::Limit,
            0.5,
            Some(40_000.0),
            Some(40_000.0),
        )
    }

    fn sample_event(hours_from_now: i64, impact: EventImpact) -> EconomicEvent {
        EconomicEvent {
            id: 0,
            event_type: EventType::Cpi,
            country: "US".into(),
            title: "CPI YoY".into(),
            release_time: Utc::now() + Duration::hours(hours_from_now),
            forecast: Some(3.2),
            actual: None,
            previous: Some(3.1),
            impact,
            deviation_from_forecast: None,
            source: "calendar".into(),
            external_id: String::new(),
        }
    }

    #[test]
    fn trade_roundtrip() {
        let s = store();
        let mut t = sample_trade("100");
        t.macro_context = "3D: BULLISH".into();
        t.vpa_pattern = "CLIMAX_LOW".into();
        let id = s.insert_trade(&t).unwrap();

        let loaded = s.get_trade(id).unwrap().unwrap();
        assert_eq!(loaded.exchange_order_id, "100");
        assert_eq!(loaded.status, OrderStatus::Pending);
        assert_eq!(loaded.vpa_pattern, "CLIMAX_LOW");
        assert!((loaded.requested_quantity - 0.5).abs() < 1e-12);
        // f64 columns round-trip exactly through REAL storage.
        assert_eq!(loaded.requested_price, Some(40_000.0));
    }

    #[test]
    fn duplicate_exchange_order_id_rejected() {
        let s = store();
        s.insert_trade(&sample_trade("7")).unwrap();
        assert!(s.insert_trade(&sample_trade("7")).is_err());
    }

    #[test]
    fn trade_fill_update() {
        let s = store();
        let mut t = sample_trade("8");
        t.id = s.insert_trade(&t).unwrap();

        t.filled_quantity = 0.5;
        t.average_price = Some(40_010.0);
        t.status = OrderStatus::Filled;
        t.filled_at = Some(Utc::now());
        t.calculate_slippage();
        s.update_trade(&t).unwrap();

        let loaded = s.get_trade(t.id).unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert!(loaded.filled_at.is_some());
        assert!((loaded.slippage - 10.0).abs() < 1e-9);
        assert!(loaded.filled_quantity <= loaded.requested_quantity);
    }

    #[test]
    fn position_roundtrip_and_open_lookup() {
        let s = store();
        let trade_id = s.insert_trade(&sample_trade("9")).unwrap();
        let pos = Position::open(trade_id, "BTCUSDT", Side::Buy, 0.5, 100.0, 98.0, Some(104.0));
        s.insert_position(&pos).unwrap();

        let open = s.get_open_position("BTCUSDT").unwrap().unwrap();
        assert_eq!(open.id, pos.id);
        assert_eq!(open.status, PositionStatus::Open);
        assert_eq!(open.take_profit, Some(104.0));
        assert!(s.get_open_position("ETHUSDT").unwrap().is_none());
    }

    #[test]
    fn conditional_close_is_idempotent() {
        let s = store();
        let entry_id = s.insert_trade(&sample_trade("10")).unwrap();
        let exit_id = s.insert_trade(&sample_trade("11")).unwrap();
        let pos = Position::open(entry_id, "BTCUSDT", Side::Buy, 0.5, 100.0, 98.0, None);
        s.insert_position(&pos).unwrap();

        // First close performs the transition, second sees CLOSED and no-ops.
        assert!(s.close_position_if_open(&pos.id, exit_id, "STOP_LOSS").unwrap());
        assert!(!s.close_position_if_open(&pos.id, exit_id, "STOP_LOSS").unwrap());

        let closed = s.get_position(&pos.id).unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.close_reason.as_deref(), Some("STOP_LOSS"));
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.exit_trade_id, Some(exit_id));
    }

    #[test]
    fn trailing_state_persists() {
        let s = store();
        let trade_id = s.insert_trade(&sample_trade("12")).unwrap();
        let mut pos = Position::open(trade_id, "BTCUSDT", Side::Buy, 1.0, 100.0, 98.0, None);
        s.insert_position(&pos).unwrap();

        pos.update_unrealized_pnl(110.0);
        pos.update_trailing_stop(110.0, 0.02);
        s.update_position(&pos).unwrap();

        let loaded = s.get_position(&pos.id).unwrap().unwrap();
        assert!(loaded.trailing_activated);
        assert_eq!(loaded.highest_price, Some(110.0));
        assert!((loaded.current_stop - pos.current_stop).abs() < 1e-12);
    }

    #[test]
    fn risk_state_lazy_creation() {
        let s = store();
        let today = Utc::now().date_naive();

        let first = s.get_or_create_risk_state(today, 10_000.0).unwrap();
        assert!((first.starting_balance - 10_000.0).abs() < 1e-9);

        // Second access returns the same row, ignoring the new seed balance.
        let second = s.get_or_create_risk_state(today, 99_999.0).unwrap();
        assert!((second.starting_balance - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn risk_counters() {
        let s = store();
        let today = Utc::now().date_naive();
        s.get_or_create_risk_state(today, 10_000.0).unwrap();

        s.record_trade_opened(today).unwrap();
        s.record_trade_opened(today).unwrap();
        s.record_trade_result(today, 25.0).unwrap();
        s.record_trade_result(today, -10.0).unwrap();

        let state = s.get_or_create_risk_state(today, 0.0).unwrap();
        assert_eq!(state.total_trades, 2);
        assert_eq!(state.winning_trades, 1);
        assert_eq!(state.losing_trades, 1);
    }

    #[test]
    fn event_upsert_and_windows() {
        let s = store();
        let now = Utc::now();

        s.upsert_event(&sample_event(2, EventImpact::High)).unwrap();
        s.upsert_event(&sample_event(-1, EventImpact::Medium)).unwrap();
        s.upsert_event(&sample_event(-30, EventImpact::High)).unwrap(); // outside 2h window
        s.upsert_event(&sample_event(5, EventImpact::Low)).unwrap(); // filtered by impact

        let upcoming = s.upcoming_events(now, 5).unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].event_type, EventType::Cpi);

        let recent = s.recent_events(now, 5).unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].release_time < now);
    }

    #[test]
    fn event_uniqueness_updates_in_place() {
        let s = store();
        let mut ev = sample_event(3, EventImpact::Medium);
        s.upsert_event(&ev).unwrap();

        // Same (type, country, release_time) with the actual released.
        ev.actual = Some(3.5);
        ev.calculate_deviation();
        s.upsert_event(&ev).unwrap();

        let upcoming = s.upcoming_events(Utc::now(), 5).unwrap();
        assert_eq!(upcoming.len(), 1);
        assert!(upcoming[0].actual.is_some());
        assert!(upcoming[0].deviation_from_forecast.is_some());
    }

    #[test]
    fn closed_candles_are_immutable() {
        let s = store();
        let key = CandleKey::new("BTCUSDT", "1m");
        let candle = Candle::new(1_700_000_000_000, 10.0, 14.0, 9.0, 13.0, 100.0, 1_700_000_059_999);

        s.insert_candle(&key, &candle).unwrap();
        // Re-inserting the same open_time is a no-op.
        let mut mutated = candle.clone();
        mutated.close = 999.0;
        s.insert_candle(&key, &mutated).unwrap();

        let close: f64 = s
            .conn
            .lock()
            .query_row(
                "SELECT close FROM market_data WHERE symbol='BTCUSDT' AND timeframe='1m' AND open_time=?1",
                params![candle.open_time],
                |r| r.get(0),
            )
            .unwrap();
        assert!((close - 13.0).abs() < 1e-12);
    }
}
