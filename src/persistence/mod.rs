//! SQLite persistence for risk state.
//!
//! Append-only history tables (snapshots, events, equity) plus upserted
//! current state (positions, daily summary). Decimals are stored as TEXT to
//! keep venue precision; timestamps as RFC 3339.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::exchange::Position;
use crate::monitor::TriggerEvent;
use crate::pnl::{DailySummary, EquitySnapshot, MarginAlert, PnlSnapshot};

/// A persisted risk event row, for the status CLI.
#[derive(Debug, Clone)]
pub struct StoredRiskEvent {
    pub event_type: String,
    pub action_type: String,
    pub symbol: Option<String>,
    pub severity: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn parse_decimal(text: &str) -> Decimal {
    Decimal::from_str(text).unwrap_or(Decimal::ZERO)
}

fn parse_ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("Risk store initialized at {:?}", path.as_ref());
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().expect("store lock poisoned").execute_batch(
            r#"
            -- Position snapshot (one row per symbol)
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                mark_price TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                margin_type TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Append-only PnL history
            CREATE TABLE IF NOT EXISTS pnl_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                total_pnl TEXT NOT NULL,
                margin_used TEXT NOT NULL,
                margin_ratio TEXT NOT NULL,
                mark_price TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                position_size TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pnl_snapshots_created ON pnl_snapshots(created_at);
            CREATE INDEX IF NOT EXISTS idx_pnl_snapshots_symbol ON pnl_snapshots(symbol);

            -- Alert lifecycle
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                strategy TEXT,
                symbol TEXT,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                condition TEXT,
                value TEXT NOT NULL,
                threshold TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status);

            -- Emitted trigger events
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                action_type TEXT NOT NULL,
                symbol TEXT,
                current_value TEXT NOT NULL,
                threshold_value TEXT NOT NULL,
                message TEXT NOT NULL,
                severity TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_risk_events_created ON risk_events(created_at);

            -- Protective margin alerts
            CREATE TABLE IF NOT EXISTS margin_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                current_ratio TEXT NOT NULL,
                threshold_ratio TEXT NOT NULL,
                message TEXT NOT NULL,
                severity TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_margin_alerts_created ON margin_alerts(created_at);

            -- Daily rollup (one row per trade date)
            CREATE TABLE IF NOT EXISTS daily_pnl_summary (
                trade_date TEXT PRIMARY KEY,
                starting_balance TEXT NOT NULL,
                ending_balance TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                total_pnl TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Account equity curve
            CREATE TABLE IF NOT EXISTS account_equity_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                total_equity TEXT NOT NULL,
                available_balance TEXT NOT NULL,
                used_margin TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                margin_ratio TEXT NOT NULL,
                position_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_equity_history_created ON account_equity_history(created_at);
            "#,
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    pub fn upsert_position(&self, position: &Position) -> Result<()> {
        self.conn.lock().expect("store lock poisoned").execute(
            r#"
            INSERT INTO positions
                (symbol, side, size, entry_price, mark_price, unrealized_pnl,
                 realized_pnl, leverage, margin_type, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(symbol) DO UPDATE SET
                side = excluded.side,
                size = excluded.size,
                entry_price = excluded.entry_price,
                mark_price = excluded.mark_price,
                unrealized_pnl = excluded.unrealized_pnl,
                realized_pnl = excluded.realized_pnl,
                leverage = excluded.leverage,
                margin_type = excluded.margin_type,
                updated_at = excluded.updated_at
            "#,
            params![
                position.symbol,
                format!("{:?}", position.side).to_uppercase(),
                position.size.to_string(),
                position.entry_price.to_string(),
                position.mark_price.to_string(),
                position.unrealized_pnl.to_string(),
                position.realized_pnl.to_string(),
                position.leverage,
                format!("{:?}", position.margin_type).to_lowercase(),
                position.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_position(&self, symbol: &str) -> Result<()> {
        self.conn
            .lock()
            .expect("store lock poisoned")
            .execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
        Ok(())
    }

    pub fn insert_pnl_snapshot(&self, snapshot: &PnlSnapshot) -> Result<()> {
        let total = snapshot.unrealized_pnl + snapshot.realized_pnl;
        self.conn.lock().expect("store lock poisoned").execute(
            r#"
            INSERT INTO pnl_snapshots
                (symbol, unrealized_pnl, realized_pnl, total_pnl, margin_used,
                 margin_ratio, mark_price, entry_price, position_size, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                snapshot.symbol,
                snapshot.unrealized_pnl.to_string(),
                snapshot.realized_pnl.to_string(),
                total.to_string(),
                snapshot.margin_used.to_string(),
                snapshot.margin_ratio.to_string(),
                snapshot.mark_price.to_string(),
                snapshot.entry_price.to_string(),
                snapshot.size.to_string(),
                snapshot.at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Record an emitted trigger event, both as history and as an active
    /// alert.
    pub fn insert_trigger_event(&self, event: &TriggerEvent) -> Result<()> {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            r#"
            INSERT INTO risk_events
                (event_type, action_type, symbol, current_value, threshold_value,
                 message, severity, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                event.trigger.as_str(),
                event.action.as_str(),
                event.symbol,
                event.current_value.to_string(),
                event.threshold.to_string(),
                event.message,
                event.severity.as_str(),
                metadata,
                event.created_at.to_rfc3339(),
            ],
        )?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO alerts
                (id, strategy, symbol, type, status, condition, value, threshold,
                 message, metadata, created_at, updated_at, resolved_at)
            VALUES (?1, 'risk_core', ?2, ?3, 'active', ?4, ?5, ?6, ?7, ?8, ?9, ?9, NULL)
            "#,
            params![
                event.id,
                event.symbol,
                event.trigger.as_str(),
                event.action.as_str(),
                event.current_value.to_string(),
                event.threshold.to_string(),
                event.message,
                metadata,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Flip an alert to resolved.
    pub fn mark_alert_resolved(&self, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn.lock().expect("store lock poisoned").execute(
            r#"
            UPDATE alerts
            SET status = 'resolved', resolved_at = ?2, updated_at = ?2
            WHERE id = ?1
            "#,
            params![event_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_margin_alert(&self, alert: &MarginAlert) -> Result<()> {
        self.conn.lock().expect("store lock poisoned").execute(
            r#"
            INSERT INTO margin_alerts
                (symbol, alert_type, current_ratio, threshold_ratio, message,
                 severity, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                alert.symbol,
                alert.kind.as_str(),
                alert.current_ratio.to_string(),
                alert.threshold_ratio.to_string(),
                alert.message,
                alert.severity.as_str(),
                alert.at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_daily_summary(&self, summary: &DailySummary, now: DateTime<Utc>) -> Result<()> {
        let total = summary.realized_pnl + summary.unrealized_pnl;
        self.conn.lock().expect("store lock poisoned").execute(
            r#"
            INSERT INTO daily_pnl_summary
                (trade_date, starting_balance, ending_balance, realized_pnl,
                 unrealized_pnl, total_pnl, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(trade_date) DO UPDATE SET
                ending_balance = excluded.ending_balance,
                realized_pnl = excluded.realized_pnl,
                unrealized_pnl = excluded.unrealized_pnl,
                total_pnl = excluded.total_pnl,
                updated_at = excluded.updated_at
            "#,
            params![
                summary.date.to_string(),
                summary.starting_equity.to_string(),
                summary.current_equity.to_string(),
                summary.realized_pnl.to_string(),
                summary.unrealized_pnl.to_string(),
                total.to_string(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_equity_snapshot(&self, snapshot: &EquitySnapshot) -> Result<()> {
        self.conn.lock().expect("store lock poisoned").execute(
            r#"
            INSERT INTO account_equity_history
                (total_equity, available_balance, used_margin, unrealized_pnl,
                 realized_pnl, margin_ratio, position_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                snapshot.total_equity.to_string(),
                snapshot.available_balance.to_string(),
                snapshot.used_margin.to_string(),
                snapshot.unrealized_pnl.to_string(),
                snapshot.realized_pnl.to_string(),
                snapshot.margin_ratio.to_string(),
                snapshot.position_count as i64,
                snapshot.at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Delete aged history rows. Returns the number of rows removed.
    pub fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let cutoff = older_than.to_rfc3339();
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut removed = 0;
        for table in ["pnl_snapshots", "margin_alerts", "account_equity_history"] {
            removed += conn.execute(
                &format!("DELETE FROM {} WHERE created_at < ?1", table),
                params![cutoff],
            )?;
        }
        if removed > 0 {
            debug!(removed, "History cleanup");
        }
        Ok(removed)
    }

    /// Latest persisted equity snapshot.
    pub fn latest_equity(&self) -> Result<Option<EquitySnapshot>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let row = conn
            .query_row(
                r#"
                SELECT total_equity, available_balance, used_margin, unrealized_pnl,
                       realized_pnl, margin_ratio, position_count, created_at
                FROM account_equity_history
                ORDER BY id DESC LIMIT 1
                "#,
                [],
                |row| {
                    Ok(EquitySnapshot {
                        total_equity: parse_decimal(&row.get::<_, String>(0)?),
                        available_balance: parse_decimal(&row.get::<_, String>(1)?),
                        used_margin: parse_decimal(&row.get::<_, String>(2)?),
                        unrealized_pnl: parse_decimal(&row.get::<_, String>(3)?),
                        realized_pnl: parse_decimal(&row.get::<_, String>(4)?),
                        margin_ratio: parse_decimal(&row.get::<_, String>(5)?),
                        position_count: row.get::<_, i64>(6)? as usize,
                        at: parse_ts(&row.get::<_, String>(7)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Summary row for one trade date.
    pub fn daily_summary(&self, date: NaiveDate) -> Result<Option<DailySummary>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let row = conn
            .query_row(
                r#"
                SELECT starting_balance, ending_balance, realized_pnl, unrealized_pnl
                FROM daily_pnl_summary WHERE trade_date = ?1
                "#,
                params![date.to_string()],
                |row| {
                    Ok(DailySummary {
                        date,
                        starting_equity: parse_decimal(&row.get::<_, String>(0)?),
                        current_equity: parse_decimal(&row.get::<_, String>(1)?),
                        realized_pnl: parse_decimal(&row.get::<_, String>(2)?),
                        unrealized_pnl: parse_decimal(&row.get::<_, String>(3)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent risk events, newest first.
    pub fn recent_events(&self, limit: u32) -> Result<Vec<StoredRiskEvent>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT event_type, action_type, symbol, severity, message, created_at
            FROM risk_events ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(StoredRiskEvent {
                    event_type: row.get(0)?,
                    action_type: row.get(1)?,
                    symbol: row.get(2)?,
                    severity: row.get(3)?,
                    message: row.get(4)?,
                    created_at: parse_ts(&row.get::<_, String>(5)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
