// Persistent storage for liquidation events and subscribers, on SQLite
// Ingest never blocks on a failed insert; the caller logs and drops

use crate::config::{DEFAULT_MIN_LIQUIDATION_ALERT, DEFAULT_REPORT_INTERVAL_HOURS, REPORT_INTERVALS};
use crate::types::{LiquidationEvent, Side, Subscriber};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Storage {
    db: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Create or open the database at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS liquidations (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol    TEXT NOT NULL,
                side      TEXT NOT NULL,
                price     REAL NOT NULL,
                quantity  REAL NOT NULL,
                time_ms   INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_liquidations_symbol_time
                ON liquidations (symbol ASC, time_ms DESC);

            CREATE TABLE IF NOT EXISTS subscribers (
                chat_id                INTEGER PRIMARY KEY,
                first_name             TEXT,
                username               TEXT,
                tracked_symbols        TEXT NOT NULL DEFAULT '[]',
                notifications_enabled  INTEGER NOT NULL DEFAULT 1,
                report_interval_hours  INTEGER NOT NULL DEFAULT 4,
                min_liquidation_alert  INTEGER NOT NULL DEFAULT 10000,
                created_at_ms          INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Liquidations
    // ========================================================================

    pub async fn save_liquidation(&self, event: &LiquidationEvent) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO liquidations (symbol, side, price, quantity, time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.symbol,
                event.side.label(),
                event.price,
                event.quantity,
                event.time.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Events for one symbol in the half-open window [start, end), ordered by time.
    pub async fn liquidations_between(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LiquidationEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT symbol, side, price, quantity, time_ms FROM liquidations
             WHERE symbol = ?1 AND time_ms >= ?2 AND time_ms < ?3
             ORDER BY time_ms ASC",
        )?;
        let rows = stmt.query_map(
            params![symbol, start.timestamp_millis(), end.timestamp_millis()],
            row_to_event,
        )?;
        collect_events(rows)
    }

    /// Events across all symbols in the half-open window [start, end).
    pub async fn overall_liquidations_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LiquidationEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT symbol, side, price, quantity, time_ms FROM liquidations
             WHERE time_ms >= ?1 AND time_ms < ?2
             ORDER BY time_ms ASC",
        )?;
        let rows = stmt.query_map(
            params![start.timestamp_millis(), end.timestamp_millis()],
            row_to_event,
        )?;
        collect_events(rows)
    }

    /// Delete events older than the cutoff; returns the number removed.
    pub async fn delete_liquidations_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let db = self.db.lock().await;
        let deleted = db.execute(
            "DELETE FROM liquidations WHERE time_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(deleted as u64)
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    /// Return the existing subscriber or insert one with defaults. Safe
    /// under a duplicate-key race: the insert is a no-op for the loser and
    /// the follow-up read returns the winning row.
    pub async fn find_or_create_subscriber(
        &self,
        chat_id: i64,
        first_name: Option<&str>,
        username: Option<&str>,
    ) -> Result<Subscriber> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO subscribers
                 (chat_id, first_name, username, tracked_symbols,
                  notifications_enabled, report_interval_hours,
                  min_liquidation_alert, created_at_ms)
             VALUES (?1, ?2, ?3, '[]', 1, ?4, ?5, ?6)
             ON CONFLICT (chat_id) DO NOTHING",
            params![
                chat_id,
                first_name,
                username,
                DEFAULT_REPORT_INTERVAL_HOURS,
                DEFAULT_MIN_LIQUIDATION_ALERT as i64,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Self::get_subscriber_locked(&db, chat_id)
    }

    pub async fn get_subscriber(&self, chat_id: i64) -> Result<Subscriber> {
        let db = self.db.lock().await;
        Self::get_subscriber_locked(&db, chat_id)
    }

    fn get_subscriber_locked(db: &Connection, chat_id: i64) -> Result<Subscriber> {
        db.query_row(
            "SELECT chat_id, first_name, username, tracked_symbols,
                    notifications_enabled, report_interval_hours,
                    min_liquidation_alert, created_at_ms
             FROM subscribers WHERE chat_id = ?1",
            params![chat_id],
            row_to_subscriber,
        )
        .optional()?
        .ok_or_else(|| anyhow!("subscriber {chat_id} not found"))
    }

    /// Set-XOR the symbol into the subscriber's tracked set.
    pub async fn toggle_tracked_symbol(&self, chat_id: i64, symbol: &str) -> Result<Subscriber> {
        let db = self.db.lock().await;
        let current = Self::get_subscriber_locked(&db, chat_id)?;
        let mut symbols = current.tracked_symbols;
        if !symbols.remove(symbol) {
            symbols.insert(symbol.to_string());
        }
        Self::write_tracked_symbols(&db, chat_id, &symbols)?;
        Self::get_subscriber_locked(&db, chat_id)
    }

    /// Replace the whole tracked set.
    pub async fn set_tracked_symbols(
        &self,
        chat_id: i64,
        symbols: &BTreeSet<String>,
    ) -> Result<Subscriber> {
        let db = self.db.lock().await;
        Self::write_tracked_symbols(&db, chat_id, symbols)?;
        Self::get_subscriber_locked(&db, chat_id)
    }

    fn write_tracked_symbols(
        db: &Connection,
        chat_id: i64,
        symbols: &BTreeSet<String>,
    ) -> Result<()> {
        let encoded = serde_json::to_string(symbols)?;
        let updated = db.execute(
            "UPDATE subscribers SET tracked_symbols = ?1 WHERE chat_id = ?2",
            params![encoded, chat_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("subscriber {chat_id} not found"));
        }
        Ok(())
    }

    /// Set notifications to the given value, or flip when `None`.
    pub async fn set_notifications(
        &self,
        chat_id: i64,
        enabled: Option<bool>,
    ) -> Result<Subscriber> {
        let db = self.db.lock().await;
        let current = Self::get_subscriber_locked(&db, chat_id)?;
        let next = enabled.unwrap_or(!current.notifications_enabled);
        db.execute(
            "UPDATE subscribers SET notifications_enabled = ?1 WHERE chat_id = ?2",
            params![next as i64, chat_id],
        )?;
        Self::get_subscriber_locked(&db, chat_id)
    }

    pub async fn set_report_interval(&self, chat_id: i64, hours: u32) -> Result<Subscriber> {
        if !REPORT_INTERVALS.contains(&hours) {
            return Err(anyhow!(
                "report interval must be one of {REPORT_INTERVALS:?}, got {hours}"
            ));
        }
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE subscribers SET report_interval_hours = ?1 WHERE chat_id = ?2",
            params![hours, chat_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("subscriber {chat_id} not found"));
        }
        Self::get_subscriber_locked(&db, chat_id)
    }

    pub async fn set_alert_threshold(&self, chat_id: i64, amount: u64) -> Result<Subscriber> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE subscribers SET min_liquidation_alert = ?1 WHERE chat_id = ?2",
            params![amount as i64, chat_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("subscriber {chat_id} not found"));
        }
        Self::get_subscriber_locked(&db, chat_id)
    }

    /// Subscribers with notifications enabled that track the given symbol.
    pub async fn subscribers_tracking(&self, symbol: &str) -> Result<Vec<Subscriber>> {
        let enabled = self.enabled_subscribers().await?;
        Ok(enabled
            .into_iter()
            .filter(|s| s.tracked_symbols.contains(symbol))
            .collect())
    }

    /// Subscribers with notifications enabled and a non-empty tracked set.
    pub async fn active_subscribers(&self) -> Result<Vec<Subscriber>> {
        let enabled = self.enabled_subscribers().await?;
        Ok(enabled
            .into_iter()
            .filter(|s| !s.tracked_symbols.is_empty())
            .collect())
    }

    async fn enabled_subscribers(&self) -> Result<Vec<Subscriber>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT chat_id, first_name, username, tracked_symbols,
                    notifications_enabled, report_interval_hours,
                    min_liquidation_alert, created_at_ms
             FROM subscribers WHERE notifications_enabled = 1",
        )?;
        let rows = stmt.query_map([], row_to_subscriber)?;
        let mut subscribers = Vec::new();
        for row in rows {
            subscribers.push(row?);
        }
        Ok(subscribers)
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<LiquidationEvent> {
    let side: String = row.get(1)?;
    let time_ms: i64 = row.get(4)?;
    Ok(LiquidationEvent {
        symbol: row.get(0)?,
        side: if side == "Short" { Side::Short } else { Side::Long },
        price: row.get(2)?,
        quantity: row.get(3)?,
        time: Utc
            .timestamp_millis_opt(time_ms)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn row_to_subscriber(row: &Row<'_>) -> rusqlite::Result<Subscriber> {
    let tracked_raw: String = row.get(3)?;
    let created_ms: i64 = row.get(7)?;
    Ok(Subscriber {
        chat_id: row.get(0)?,
        first_name: row.get(1)?,
        username: row.get(2)?,
        tracked_symbols: serde_json::from_str(&tracked_raw).unwrap_or_default(),
        notifications_enabled: row.get::<_, i64>(4)? != 0,
        report_interval_hours: row.get::<_, i64>(5)? as u32,
        min_liquidation_alert: row.get::<_, i64>(6)?.max(0) as u64,
        created_at: Utc
            .timestamp_millis_opt(created_ms)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<LiquidationEvent>>,
) -> Result<Vec<LiquidationEvent>> {
    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}
