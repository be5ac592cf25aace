//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::incidents::{open_incident_in, resolve_incident_in};
use super::models::*;
use crate::monitor::{transition, HysteresisPolicy, Transition};

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
///
/// SQLite is single-writer; every write goes through the one connection
/// behind the mutex.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const MONITOR_COLUMNS: &str = "id, owner, url, interval_seconds, confirmed_status, \
     consecutive_failures, consecutive_successes, tls_expiry_at, tls_alerted_days, created_at";

const PROBE_COLUMNS: &str = "id, monitor_id, dns_ms, tcp_ms, tls_ms, ttfb_ms, status, reason, \
     root_cause, http_status, checked_at";

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();

        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;

        Ok(())
    }

    pub(super) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while the lock was held cannot leave SQLite half-written.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Monitor CRUD ---

    /// Add a new monitor and return its ID.
    pub fn add_monitor(&self, monitor: &mut Monitor) -> Result<i64, DbError> {
        if monitor.interval_seconds <= 0 {
            monitor.interval_seconds = 60;
        }

        let conn = self.conn();
        conn.execute(
            "INSERT INTO monitors (owner, url, interval_seconds, confirmed_status, \
             consecutive_failures, consecutive_successes, tls_expiry_at, tls_alerted_days, \
             created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                monitor.owner,
                monitor.url,
                monitor.interval_seconds,
                monitor.confirmed_status.as_str(),
                monitor.consecutive_failures,
                monitor.consecutive_successes,
                monitor.tls_expiry_at.as_ref().map(db_time),
                serde_json::to_string(&monitor.tls_alerted_days)?,
                db_time(&monitor.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        monitor.id = id;
        Ok(id)
    }

    /// Change a monitor's URL and cadence.
    ///
    /// A new URL means a different certificate, so the TLS state is reset.
    pub fn update_monitor(
        &self,
        id: i64,
        url: &str,
        interval_seconds: i64,
    ) -> Result<Monitor, DbError> {
        let interval_seconds = if interval_seconds <= 0 { 60 } else { interval_seconds };
        {
            let conn = self.conn();
            let changed = conn.execute(
                "UPDATE monitors SET \
                 tls_expiry_at = CASE WHEN url = ?1 THEN tls_expiry_at ELSE NULL END, \
                 tls_alerted_days = CASE WHEN url = ?1 THEN tls_alerted_days ELSE '[]' END, \
                 url = ?1, interval_seconds = ?2 \
                 WHERE id = ?3",
                params![url, interval_seconds, id],
            )?;
            if changed == 0 {
                return Err(DbError::NotFound);
            }
        }
        self.get_monitor(id)
    }

    /// Get all monitors.
    pub fn get_monitors(&self) -> Result<Vec<Monitor>, DbError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM monitors ORDER BY id", MONITOR_COLUMNS))?;

        let monitors = stmt
            .query_map([], monitor_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(monitors)
    }

    /// Get a monitor by ID, or `None` if it was deleted.
    pub fn find_monitor(&self, id: i64) -> Result<Option<Monitor>, DbError> {
        let conn = self.conn();
        let monitor = conn
            .query_row(
                &format!("SELECT {} FROM monitors WHERE id = ?1", MONITOR_COLUMNS),
                params![id],
                monitor_from_row,
            )
            .optional()?;
        Ok(monitor)
    }

    /// Get a monitor by ID.
    pub fn get_monitor(&self, id: i64) -> Result<Monitor, DbError> {
        self.find_monitor(id)?.ok_or(DbError::NotFound)
    }

    /// Delete a monitor and everything recorded for it.
    pub fn delete_monitor(&self, id: i64) -> Result<bool, DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM probe_results WHERE monitor_id = ?1", params![id])?;
        tx.execute("DELETE FROM incidents WHERE monitor_id = ?1", params![id])?;
        tx.execute("DELETE FROM maintenance_windows WHERE monitor_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    // --- Check results ---

    /// Record one check atomically: advance the hysteresis counters, open or
    /// resolve the incident on a confirmed transition, and append the probe
    /// result.
    ///
    /// Returns [`DbError::NotFound`] if the monitor no longer exists, in which
    /// case nothing is written.
    pub fn apply_check(
        &self,
        record: &ProbeRecord,
        policy: &HysteresisPolicy,
    ) -> Result<CheckOutcome, DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let monitor = tx
            .query_row(
                &format!("SELECT {} FROM monitors WHERE id = ?1", MONITOR_COLUMNS),
                params![record.monitor_id],
                monitor_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        let (next, change) = transition(&monitor.state(), record.status, policy);

        tx.execute(
            "UPDATE monitors SET confirmed_status = ?1, consecutive_failures = ?2, \
             consecutive_successes = ?3 WHERE id = ?4",
            params![
                next.confirmed.as_str(),
                next.consecutive_failures,
                next.consecutive_successes,
                monitor.id,
            ],
        )?;

        let incident = match change {
            Transition::WentDown => {
                open_incident_in(&tx, monitor.id, record.root_cause, record.checked_at)?
            }
            Transition::Recovered => resolve_incident_in(&tx, monitor.id, record.checked_at)?,
            Transition::Unchanged => None,
        };

        insert_probe_record(&tx, record)?;
        tx.commit()?;

        Ok(CheckOutcome {
            monitor: Monitor {
                confirmed_status: next.confirmed,
                consecutive_failures: next.consecutive_failures,
                consecutive_successes: next.consecutive_successes,
                ..monitor
            },
            transition: change,
            incident,
        })
    }

    /// Append a probe result without touching monitor state. Checks always
    /// go through [`Store::apply_check`]; this only seeds history in tests.
    #[cfg(test)]
    pub fn add_probe_result(&self, record: &ProbeRecord) -> Result<i64, DbError> {
        let conn = self.conn();
        insert_probe_record(&conn, record)
    }

    /// Most recent probe results for a monitor, newest first.
    pub fn get_probe_results(
        &self,
        monitor_id: i64,
        limit: i64,
    ) -> Result<Vec<ProbeRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM probe_results WHERE monitor_id = ?1 \
             ORDER BY checked_at DESC, id DESC LIMIT ?2",
            PROBE_COLUMNS
        ))?;

        let results = stmt
            .query_map(params![monitor_id, limit], probe_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }

    /// Delete probe results before a cutoff time.
    pub fn delete_probe_results_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM probe_results WHERE checked_at < ?1",
            params![db_time(&cutoff)],
        )?;
        Ok(deleted)
    }

    // --- TLS expiry state ---

    /// Persist the certificate expiry and the thresholds already alerted.
    ///
    /// Compare-and-set on the alerted set: the write only applies if the
    /// stored set still equals `expected`. Returns `false` when another check
    /// changed it first.
    pub fn update_tls_state(
        &self,
        monitor_id: i64,
        expiry: Option<DateTime<Utc>>,
        expected: &BTreeSet<u32>,
        alerted_days: &BTreeSet<u32>,
    ) -> Result<bool, DbError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE monitors SET tls_expiry_at = ?1, tls_alerted_days = ?2 \
             WHERE id = ?3 AND tls_alerted_days = ?4",
            params![
                expiry.as_ref().map(db_time),
                serde_json::to_string(alerted_days)?,
                monitor_id,
                serde_json::to_string(expected)?,
            ],
        )?;
        if changed > 0 {
            return Ok(true);
        }

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM monitors WHERE id = ?1)",
            params![monitor_id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(false)
        } else {
            Err(DbError::NotFound)
        }
    }

    // --- Maintenance windows ---

    /// Add a maintenance window and return its ID.
    pub fn add_maintenance_window(&self, window: &mut MaintenanceWindow) -> Result<i64, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO maintenance_windows (monitor_id, starts_at, ends_at, reason) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                window.monitor_id,
                db_time(&window.starts_at),
                db_time(&window.ends_at),
                window.reason,
            ],
        )?;
        let id = conn.last_insert_rowid();
        window.id = id;
        Ok(id)
    }

    /// Whether `now` falls inside any maintenance window of the monitor.
    pub fn is_in_maintenance(&self, monitor_id: i64, now: DateTime<Utc>) -> Result<bool, DbError> {
        let conn = self.conn();
        let active: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM maintenance_windows \
             WHERE monitor_id = ?1 AND starts_at <= ?2 AND ends_at >= ?2)",
            params![monitor_id, db_time(&now)],
            |row| row.get(0),
        )?;
        Ok(active)
    }

    // --- Reporting ---

    /// Check counts and incident aggregates for a reporting period.
    pub fn period_summary(
        &self,
        monitor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<PeriodSummary, DbError> {
        let conn = self.conn();
        let start = db_time(&start);
        let end = db_time(&end);

        let (total_checks, up_checks): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'UP' THEN 1 ELSE 0 END), 0) \
             FROM probe_results WHERE monitor_id = ?1 AND checked_at BETWEEN ?2 AND ?3",
            params![monitor_id, start, end],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        // Open incidents are counted but their downtime is not known yet.
        let (incident_count, total_downtime_seconds, longest_outage_seconds): (i64, i64, i64) =
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(duration_seconds), 0), \
                 COALESCE(MAX(duration_seconds), 0) FROM incidents \
                 WHERE monitor_id = ?1 AND started_at BETWEEN ?2 AND ?3",
                params![monitor_id, start, end],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        let check_uptime_percentage = if total_checks > 0 {
            up_checks as f64 / total_checks as f64 * 100.0
        } else {
            100.0
        };

        Ok(PeriodSummary {
            total_checks,
            up_checks,
            check_uptime_percentage,
            incident_count,
            total_downtime_seconds,
            longest_outage_seconds,
        })
    }
}

fn insert_probe_record(conn: &Connection, record: &ProbeRecord) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO probe_results (monitor_id, dns_ms, tcp_ms, tls_ms, ttfb_ms, status, reason, \
         root_cause, http_status, checked_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.monitor_id,
            record.dns_ms.map(|v| v as i64),
            record.tcp_ms.map(|v| v as i64),
            record.tls_ms.map(|v| v as i64),
            record.ttfb_ms.map(|v| v as i64),
            record.status.as_str(),
            record.reason.as_str(),
            record.root_cause.as_str(),
            record.http_status,
            db_time(&record.checked_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn monitor_from_row(row: &Row<'_>) -> SqlResult<Monitor> {
    Ok(Monitor {
        id: row.get(0)?,
        owner: row.get(1)?,
        url: row.get(2)?,
        interval_seconds: row.get(3)?,
        confirmed_status: parse_column(row, 4)?,
        consecutive_failures: row.get(5)?,
        consecutive_successes: row.get(6)?,
        tls_expiry_at: opt_time_column(row, 7)?,
        tls_alerted_days: alerted_days_column(row, 8)?,
        created_at: time_column(row, 9)?,
    })
}

fn probe_from_row(row: &Row<'_>) -> SqlResult<ProbeRecord> {
    let ms = |idx: usize| -> SqlResult<Option<u64>> {
        Ok(row.get::<_, Option<i64>>(idx)?.map(|v| v.max(0) as u64))
    };

    Ok(ProbeRecord {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        dns_ms: ms(2)?,
        tcp_ms: ms(3)?,
        tls_ms: ms(4)?,
        ttfb_ms: ms(5)?,
        status: parse_column(row, 6)?,
        reason: parse_column(row, 7)?,
        root_cause: parse_column(row, 8)?,
        http_status: row.get(9)?,
        checked_at: time_column(row, 10)?,
    })
}

/// Parse a text column holding one of our string-tagged enums.
pub(super) fn parse_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

pub(super) fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        let msg = format!("bad timestamp: {}", raw);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
    })
}

pub(super) fn opt_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => time_column(row, idx).map(Some),
        None => Ok(None),
    }
}

fn alerted_days_column(row: &Row<'_>, idx: usize) -> SqlResult<BTreeSet<u32>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Format a timestamp for storage. Fixed width, so text order is time order.
pub(crate) fn db_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
