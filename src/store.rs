//! Durable store. A single SQLite file behind `Arc<tokio::sync::Mutex<Connection>>`,
//! WAL + `synchronous=NORMAL`, using `prepare_cached` statements,
//! `ON CONFLICT ... DO UPDATE` upserts, and `query_map` results
//! collected via `filter_map(|r| r.ok())`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::domain::{
    AgeSource, ExitEvent, ExitStatus, Order, OrderStatus, Position, PositionStatus, Side,
    TriggerRecord, WatchlistEntry, WatchlistStatus,
};

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

impl Store {
    pub fn new(database_url: &str) -> Result<Self> {
        let conn = Connection::open(database_url)
            .with_context(|| format!("failed to open durable store at {database_url}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS triggers (
                token_id TEXT NOT NULL,
                condition_id TEXT NOT NULL,
                threshold REAL NOT NULL,
                price REAL NOT NULL,
                trigger_hash TEXT NOT NULL,
                size REAL,
                score REAL,
                outcome TEXT,
                outcome_index INTEGER,
                created_at INTEGER NOT NULL,
                UNIQUE(token_id, condition_id, threshold)
            );
            CREATE INDEX IF NOT EXISTS idx_triggers_condition_threshold
                ON triggers(condition_id, threshold);

            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                token_id TEXT NOT NULL,
                condition_id TEXT NOT NULL,
                outcome TEXT,
                outcome_index INTEGER,
                side TEXT NOT NULL DEFAULT 'BUY',
                size REAL NOT NULL,
                entry_price REAL NOT NULL,
                entry_cost REAL NOT NULL,
                realized_pnl REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                entry_order_id TEXT,
                entry_timestamp INTEGER NOT NULL,
                exit_order_id TEXT,
                exit_timestamp INTEGER,
                exit_pending INTEGER NOT NULL DEFAULT 0,
                exit_status TEXT,
                resolution TEXT,
                hold_start_at INTEGER NOT NULL,
                age_source TEXT NOT NULL DEFAULT 'unknown',
                import_source TEXT,
                description TEXT,
                claimed_at INTEGER,
                cost_basis_unknown INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_positions_token ON positions(token_id);
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);

            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                token_id TEXT NOT NULL,
                condition_id TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                size REAL NOT NULL,
                filled_size REAL NOT NULL DEFAULT 0,
                avg_fill_price REAL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

            CREATE TABLE IF NOT EXISTS exit_events (
                position_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                condition_id TEXT,
                exit_type TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                size REAL NOT NULL,
                gross_pnl REAL NOT NULL,
                net_pnl REAL NOT NULL,
                hours_held REAL NOT NULL,
                exit_order_id TEXT,
                status TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_exit_events_position ON exit_events(position_id);

            CREATE TABLE IF NOT EXISTS trade_watchlist (
                token_id TEXT PRIMARY KEY,
                condition_id TEXT NOT NULL,
                question TEXT,
                trigger_price REAL,
                initial_score REAL NOT NULL,
                current_score REAL NOT NULL,
                time_to_end_hours REAL NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS positions_sync_log (
                run_id TEXT PRIMARY KEY,
                sync_type TEXT NOT NULL,
                wallet_address TEXT NOT NULL,
                positions_found INTEGER NOT NULL,
                positions_imported INTEGER NOT NULL,
                positions_updated INTEGER NOT NULL,
                positions_closed INTEGER NOT NULL,
                errors INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                completed_at INTEGER
            );
            ",
        )
        .context("failed to initialize durable store schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- Trigger Deduplicator ------------------------------------------------

    pub async fn trigger_exists_for_condition(
        &self,
        condition_id: &str,
        threshold: f64,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM triggers WHERE condition_id = ?1 AND threshold = ?2 LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![condition_id, threshold], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub async fn trigger_exists_for_token(
        &self,
        token_id: &str,
        condition_id: &str,
        threshold: f64,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM triggers WHERE token_id = ?1 AND condition_id = ?2 AND threshold = ?3 LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![token_id, condition_id, threshold], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Authoritative claim. `BEGIN IMMEDIATE` serializes this against
    /// every other writer on the same database file, in- or
    /// cross-process, giving the same guarantee as a per-key advisory
    /// lock at whole-database granularity.
    pub async fn try_record_trigger_atomic(&self, record: &TriggerRecord) -> Result<bool> {
        let trigger_hash = trigger_hash(&record.condition_id, record.threshold);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM triggers WHERE condition_id = ?1 AND threshold = ?2 LIMIT 1",
                params![record.condition_id, record.threshold],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);

        if exists {
            tx.rollback()?;
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO triggers
                (token_id, condition_id, threshold, price, trigger_hash, size, score, outcome, outcome_index, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.token_id,
                record.condition_id,
                record.threshold,
                record.price,
                trigger_hash,
                record.trade_size,
                record.model_score,
                record.outcome,
                record.outcome_index,
                ts(record.triggered_at),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub async fn remove_trigger(
        &self,
        token_id: &str,
        condition_id: &str,
        threshold: f64,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM triggers WHERE token_id = ?1 AND condition_id = ?2 AND threshold = ?3",
            params![token_id, condition_id, threshold],
        )?;
        Ok(n > 0)
    }

    pub async fn count_triggers(&self, limit: i64) -> Result<Vec<TriggerRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT token_id, condition_id, threshold, price, size, score, outcome, outcome_index, created_at
             FROM triggers ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(TriggerRecord {
                token_id: row.get(0)?,
                condition_id: row.get(1)?,
                threshold: row.get(2)?,
                price: row.get(3)?,
                trade_size: row.get(4)?,
                model_score: row.get(5)?,
                outcome: row.get(6)?,
                outcome_index: row.get(7)?,
                triggered_at: from_ts(row.get(8)?),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ---- Orders ---------------------------------------------------------------

    pub async fn upsert_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO orders
                (order_id, token_id, condition_id, side, price, size, filled_size, avg_fill_price, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(order_id) DO UPDATE SET
                filled_size = excluded.filled_size,
                avg_fill_price = excluded.avg_fill_price,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                order.order_id,
                order.token_id,
                order.condition_id,
                order.side.as_str(),
                order.limit_price,
                order.size,
                order.filled_size,
                order.avg_fill_price,
                order.status.as_str(),
                ts(order.created_at),
                ts(order.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, token_id, condition_id, side, price, size, filled_size, avg_fill_price, status, created_at, updated_at
             FROM orders WHERE order_id = ?1",
        )?;
        let row = stmt
            .query_row(params![order_id], row_to_order)
            .optional()?;
        Ok(row)
    }

    pub async fn open_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, token_id, condition_id, side, price, size, filled_size, avg_fill_price, status, created_at, updated_at
             FROM orders WHERE status NOT IN ('FILLED','CANCELLED','FAILED')",
        )?;
        let rows = stmt.query_map([], row_to_order)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn all_orders(&self, limit: i64) -> Result<Vec<Order>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, token_id, condition_id, side, price, size, filled_size, avg_fill_price, status, created_at, updated_at
             FROM orders ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_order)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ---- Positions --------------------------------------------------------------

    pub async fn upsert_position(&self, pos: &Position) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions
                (id, token_id, condition_id, outcome, outcome_index, side, size, entry_price, entry_cost,
                 realized_pnl, status, entry_order_id, entry_timestamp, exit_order_id, exit_timestamp,
                 exit_pending, exit_status, hold_start_at, age_source, import_source, description,
                 claimed_at, cost_basis_unknown)
             VALUES (?1,?2,?3,?4,?5,'BUY',?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)
             ON CONFLICT(id) DO UPDATE SET
                size = excluded.size,
                entry_price = excluded.entry_price,
                entry_cost = excluded.entry_cost,
                realized_pnl = excluded.realized_pnl,
                status = excluded.status,
                exit_order_id = excluded.exit_order_id,
                exit_timestamp = excluded.exit_timestamp,
                exit_pending = excluded.exit_pending,
                exit_status = excluded.exit_status,
                age_source = excluded.age_source,
                description = excluded.description",
            params![
                pos.position_id,
                pos.token_id,
                pos.condition_id,
                pos.outcome,
                pos.outcome_index,
                pos.size,
                pos.entry_price,
                pos.entry_cost,
                pos.realized_pnl,
                match pos.status {
                    PositionStatus::Open => "open",
                    PositionStatus::Closed => "closed",
                },
                pos.entry_order_id,
                ts(pos.entry_time),
                pos.exit_order_id,
                Option::<i64>::None,
                pos.exit_pending as i64,
                pos.exit_status.map(|s| s.as_str()),
                ts(pos.hold_start_at),
                pos.age_source.as_str(),
                pos.import_source,
                pos.description,
                pos.claimed_at.map(ts),
                pos.cost_basis_unknown as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn open_position_for_token(&self, token_id: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, token_id, condition_id, outcome, outcome_index, size, entry_price, entry_cost,
                    realized_pnl, status, entry_order_id, entry_timestamp, exit_order_id,
                    exit_pending, exit_status, hold_start_at, age_source, import_source, description,
                    claimed_at, cost_basis_unknown
             FROM positions WHERE token_id = ?1 AND status = 'open' LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![token_id], row_to_position)
            .optional()?;
        Ok(row)
    }

    pub async fn get_position(&self, position_id: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, token_id, condition_id, outcome, outcome_index, size, entry_price, entry_cost,
                    realized_pnl, status, entry_order_id, entry_timestamp, exit_order_id,
                    exit_pending, exit_status, hold_start_at, age_source, import_source, description,
                    claimed_at, cost_basis_unknown
             FROM positions WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![position_id], row_to_position)
            .optional()?;
        Ok(row)
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, token_id, condition_id, outcome, outcome_index, size, entry_price, entry_cost,
                    realized_pnl, status, entry_order_id, entry_timestamp, exit_order_id,
                    exit_pending, exit_status, hold_start_at, age_source, import_source, description,
                    claimed_at, cost_basis_unknown
             FROM positions WHERE status = 'open'",
        )?;
        let rows = stmt.query_map([], row_to_position)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn all_positions(&self, limit: i64) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, token_id, condition_id, outcome, outcome_index, size, entry_price, entry_cost,
                    realized_pnl, status, entry_order_id, entry_timestamp, exit_order_id,
                    exit_pending, exit_status, hold_start_at, age_source, import_source, description,
                    claimed_at, cost_basis_unknown
             FROM positions ORDER BY entry_timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_position)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Atomic exit claim: moves `(exit_pending, exit_status)` from
    /// `(0, non-pending)` to `(1, 'claiming')` iff currently not pending.
    /// Stamps `claimed_at` with the claim time so a later caller can
    /// tell a fresh claim from one stuck since before a restart.
    pub async fn try_claim_exit_atomic(&self, position_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE positions SET exit_pending = 1, exit_status = 'claiming', exit_order_id = NULL, claimed_at = ?2
             WHERE id = ?1 AND status = 'open' AND exit_pending = 0",
            params![position_id, Utc::now().timestamp()],
        )?;
        Ok(n > 0)
    }

    pub async fn mark_exit_pending(&self, position_id: &str, order_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET exit_order_id = ?2, exit_status = 'pending' WHERE id = ?1",
            params![position_id, order_id],
        )?;
        Ok(())
    }

    pub async fn clear_exit_pending(&self, position_id: &str, status: ExitStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET exit_pending = 0, exit_status = ?2, claimed_at = NULL WHERE id = ?1",
            params![position_id, status.as_str()],
        )?;
        Ok(())
    }

    pub async fn set_cost_basis_unknown(&self, position_id: &str, unknown: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET cost_basis_unknown = ?2 WHERE id = ?1",
            params![position_id, unknown as i64],
        )?;
        Ok(())
    }

    pub async fn close_position(
        &self,
        position_id: &str,
        final_size: f64,
        final_entry_cost: f64,
        realized_pnl: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET size = ?2, entry_cost = ?3, realized_pnl = ?4, status = 'closed',
                exit_pending = 0, exit_status = 'closed', exit_timestamp = ?5
             WHERE id = ?1",
            params![position_id, final_size, final_entry_cost, realized_pnl, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub async fn update_open_position(
        &self,
        position_id: &str,
        size: f64,
        entry_cost: f64,
        entry_price: f64,
        realized_pnl: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE positions SET size = ?2, entry_cost = ?3, entry_price = ?4, realized_pnl = ?5 WHERE id = ?1",
            params![position_id, size, entry_cost, entry_price, realized_pnl],
        )?;
        Ok(())
    }

    pub async fn insert_exit_event(&self, event: &ExitEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO exit_events
                (position_id, token_id, condition_id, exit_type, entry_price, exit_price, size,
                 gross_pnl, net_pnl, hours_held, exit_order_id, status, reason, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                event.position_id,
                event.token_id,
                event.condition_id,
                event.exit_type,
                event.entry_price,
                event.exit_price,
                event.size,
                event.gross_pnl,
                event.net_pnl,
                event.hours_held,
                event.exit_order_id,
                event.status,
                event.reason,
                ts(event.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_exit_events(&self, limit: i64) -> Result<Vec<ExitEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT position_id, token_id, condition_id, exit_type, entry_price, exit_price, size,
                    gross_pnl, net_pnl, hours_held, exit_order_id, status, reason, created_at
             FROM exit_events ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_exit_event)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Positions with a claim in flight — the "non-terminal exits"
    /// half of the dashboard's exits/orders count.
    pub async fn pending_exits_count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE exit_pending = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    // ---- Watchlist -------------------------------------------------------------

    pub async fn upsert_watchlist(&self, entry: &WatchlistEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trade_watchlist
                (token_id, condition_id, question, trigger_price, initial_score, current_score,
                 time_to_end_hours, status, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
             ON CONFLICT(token_id) DO UPDATE SET
                current_score = excluded.current_score,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                entry.token_id,
                entry.condition_id,
                entry.question,
                entry.trigger_price,
                entry.initial_score,
                entry.current_score,
                entry.time_to_end_hours,
                entry.status.as_str(),
                ts(entry.created_at),
                ts(entry.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn watching_entries(&self) -> Result<Vec<WatchlistEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT token_id, condition_id, question, trigger_price, initial_score, current_score,
                    time_to_end_hours, status, created_at, updated_at
             FROM trade_watchlist WHERE status = 'watching'",
        )?;
        let rows = stmt.query_map([], row_to_watchlist)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn all_watchlist(&self, limit: i64) -> Result<Vec<WatchlistEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT token_id, condition_id, question, trigger_price, initial_score, current_score,
                    time_to_end_hours, status, created_at, updated_at
             FROM trade_watchlist ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_watchlist)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ---- Position sync log -------------------------------------------------------

    pub async fn insert_sync_log(
        &self,
        run_id: &str,
        sync_type: &str,
        wallet_address: &str,
        found: i64,
        imported: i64,
        updated: i64,
        closed: i64,
        errors: i64,
        started_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions_sync_log
                (run_id, sync_type, wallet_address, positions_found, positions_imported,
                 positions_updated, positions_closed, errors, started_at, completed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                run_id,
                sync_type,
                wallet_address,
                found,
                imported,
                updated,
                closed,
                errors,
                ts(started_at),
                completed_at.map(ts),
            ],
        )?;
        Ok(())
    }

    pub async fn is_reachable(&self) -> bool {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
    }
}

fn trigger_hash(condition_id: &str, threshold: f64) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(format!("{condition_id}:{threshold}").as_bytes());
    hex::encode(hasher.finalize())
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let side: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(Order {
        order_id: row.get(0)?,
        token_id: row.get(1)?,
        condition_id: row.get(2)?,
        side: side.parse().unwrap_or(Side::Buy),
        limit_price: row.get(4)?,
        size: row.get(5)?,
        filled_size: row.get(6)?,
        avg_fill_price: row.get(7)?,
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Pending),
        created_at: from_ts(row.get(9)?),
        updated_at: from_ts(row.get(10)?),
    })
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    let status: String = row.get(9)?;
    let exit_status: Option<String> = row.get(14)?;
    let age_source: String = row.get(16)?;
    Ok(Position {
        position_id: row.get(0)?,
        token_id: row.get(1)?,
        condition_id: row.get(2)?,
        outcome: row.get(3)?,
        outcome_index: row.get(4)?,
        size: row.get(5)?,
        entry_price: row.get(6)?,
        entry_cost: row.get(7)?,
        realized_pnl: row.get(8)?,
        status: if status == "closed" {
            PositionStatus::Closed
        } else {
            PositionStatus::Open
        },
        entry_order_id: row.get(10)?,
        entry_time: from_ts(row.get(11)?),
        exit_order_id: row.get(12)?,
        exit_pending: row.get::<_, i64>(13)? != 0,
        exit_status: exit_status.and_then(|s| ExitStatus::parse(&s)),
        hold_start_at: from_ts(row.get(15)?),
        age_source: AgeSource::parse(&age_source),
        import_source: row.get(17)?,
        description: row.get(18)?,
        claimed_at: row.get::<_, Option<i64>>(19)?.map(from_ts),
        cost_basis_unknown: row.get::<_, i64>(20)? != 0,
    })
}

fn row_to_exit_event(row: &rusqlite::Row) -> rusqlite::Result<ExitEvent> {
    Ok(ExitEvent {
        position_id: row.get(0)?,
        token_id: row.get(1)?,
        condition_id: row.get(2)?,
        exit_type: row.get(3)?,
        entry_price: row.get(4)?,
        exit_price: row.get(5)?,
        size: row.get(6)?,
        gross_pnl: row.get(7)?,
        net_pnl: row.get(8)?,
        hours_held: row.get(9)?,
        exit_order_id: row.get(10)?,
        status: row.get(11)?,
        reason: row.get(12)?,
        created_at: from_ts(row.get(13)?),
    })
}

fn row_to_watchlist(row: &rusqlite::Row) -> rusqlite::Result<WatchlistEntry> {
    let status: String = row.get(7)?;
    Ok(WatchlistEntry {
        token_id: row.get(0)?,
        condition_id: row.get(1)?,
        question: row.get(2)?,
        trigger_price: row.get(3)?,
        initial_score: row.get(4)?,
        current_score: row.get(5)?,
        time_to_end_hours: row.get(6)?,
        status: WatchlistStatus::parse(&status),
        created_at: from_ts(row.get(8)?),
        updated_at: from_ts(row.get(9)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TriggerRecord;

    fn test_store() -> Store {
        Store::new(":memory:").unwrap()
    }

    #[tokio::test]
    async fn trigger_claim_is_at_most_once() {
        let store = test_store();
        let rec = TriggerRecord {
            token_id: "T1".into(),
            condition_id: "C1".into(),
            threshold: 0.95,
            price: 0.96,
            trade_size: Some(100.0),
            model_score: None,
            outcome: None,
            outcome_index: None,
            triggered_at: Utc::now(),
        };
        assert!(store.try_record_trigger_atomic(&rec).await.unwrap());

        let rec2 = TriggerRecord {
            token_id: "T2".into(),
            ..rec
        };
        assert!(!store.try_record_trigger_atomic(&rec2).await.unwrap());
    }

    #[tokio::test]
    async fn exit_claim_is_exclusive() {
        let store = test_store();
        let pos = Position::new_from_fill(
            "P1".into(),
            "T1".into(),
            "C1".into(),
            20.0,
            0.96,
            Utc::now(),
            Some("O1".into()),
        );
        store.upsert_position(&pos).await.unwrap();

        assert!(store.try_claim_exit_atomic("P1").await.unwrap());
        assert!(!store.try_claim_exit_atomic("P1").await.unwrap());
    }
}
