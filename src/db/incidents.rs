//! Incident persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};

use super::models::Incident;
use super::store::{db_time, opt_time_column, parse_column, time_column, DbError, Store};
use crate::analysis::RootCause;

const INCIDENT_COLUMNS: &str =
    "id, monitor_id, started_at, resolved_at, duration_seconds, root_cause";

fn incident_from_row(row: &Row<'_>) -> SqlResult<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        started_at: time_column(row, 2)?,
        resolved_at: opt_time_column(row, 3)?,
        duration_seconds: row.get(4)?,
        root_cause: parse_column(row, 5)?,
    })
}

fn open_incident_row(conn: &Connection, monitor_id: i64) -> Result<Option<Incident>, DbError> {
    let incident = conn
        .query_row(
            &format!(
                "SELECT {} FROM incidents WHERE monitor_id = ?1 AND resolved_at IS NULL",
                INCIDENT_COLUMNS
            ),
            params![monitor_id],
            incident_from_row,
        )
        .optional()?;
    Ok(incident)
}

/// Open an incident unless one is already open for the monitor.
///
/// Returns the new incident, or `None` when one was already open.
pub(super) fn open_incident_in(
    conn: &Connection,
    monitor_id: i64,
    root_cause: RootCause,
    now: DateTime<Utc>,
) -> Result<Option<Incident>, DbError> {
    if open_incident_row(conn, monitor_id)?.is_some() {
        return Ok(None);
    }

    conn.execute(
        "INSERT INTO incidents (monitor_id, started_at, root_cause) VALUES (?1, ?2, ?3)",
        params![monitor_id, db_time(&now), root_cause.as_str()],
    )?;

    Ok(Some(Incident {
        id: conn.last_insert_rowid(),
        monitor_id,
        started_at: now,
        resolved_at: None,
        duration_seconds: None,
        root_cause,
    }))
}

/// Resolve the open incident of the monitor, if there is one.
pub(super) fn resolve_incident_in(
    conn: &Connection,
    monitor_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<Incident>, DbError> {
    let Some(open) = open_incident_row(conn, monitor_id)? else {
        return Ok(None);
    };

    let duration_seconds = duration_seconds(open.started_at, now);
    conn.execute(
        "UPDATE incidents SET resolved_at = ?1, duration_seconds = ?2 WHERE id = ?3",
        params![db_time(&now), duration_seconds, open.id],
    )?;

    Ok(Some(Incident {
        resolved_at: Some(now),
        duration_seconds: Some(duration_seconds),
        ..open
    }))
}

/// Elapsed whole seconds, rounded to nearest.
fn duration_seconds(started_at: DateTime<Utc>, resolved_at: DateTime<Utc>) -> i64 {
    let millis = (resolved_at - started_at).num_milliseconds();
    (millis as f64 / 1000.0).round() as i64
}

impl Store {
    /// Open an incident outside a check transaction; a no-op if one is
    /// already open. Checks go through [`Store::apply_check`]; this seeds
    /// incident history in tests.
    #[cfg(test)]
    pub fn open_incident(
        &self,
        monitor_id: i64,
        root_cause: RootCause,
        now: DateTime<Utc>,
    ) -> Result<Option<Incident>, DbError> {
        let conn = self.conn();
        open_incident_in(&conn, monitor_id, root_cause, now)
    }

    /// Resolve the monitor's open incident; a no-op if none is open.
    #[cfg(test)]
    pub fn resolve_incident(
        &self,
        monitor_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Incident>, DbError> {
        let conn = self.conn();
        resolve_incident_in(&conn, monitor_id, now)
    }

    /// The currently unresolved incident of the monitor.
    pub fn get_open_incident(&self, monitor_id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn();
        open_incident_row(&conn, monitor_id)
    }

    /// All incidents of the monitor, newest first.
    pub fn get_incidents(&self, monitor_id: i64) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incidents WHERE monitor_id = ?1 ORDER BY started_at DESC, id DESC",
            INCIDENT_COLUMNS
        ))?;

        let incidents = stmt
            .query_map(params![monitor_id], incident_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(incidents)
    }

    /// Incidents that started by `now` and were still open at `window_start`.
    pub fn get_overlapping_incidents(
        &self,
        monitor_id: i64,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incidents WHERE monitor_id = ?1 AND started_at <= ?2 \
             AND (resolved_at >= ?3 OR resolved_at IS NULL) ORDER BY started_at",
            INCIDENT_COLUMNS
        ))?;

        let incidents = stmt
            .query_map(
                params![monitor_id, db_time(&now), db_time(&window_start)],
                incident_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(incidents)
    }
}
