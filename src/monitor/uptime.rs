//! Rolling uptime computed from incident intervals.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::{DbError, Incident, Store};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UptimeReport {
    /// Percentage rounded to four decimals.
    pub uptime_percentage: f64,
    pub total_downtime_seconds: i64,
    pub window_hours: u32,
}

/// Uptime over the `window_hours` ending at `now`, given the incidents that
/// overlap that window.
///
/// Each incident contributes the part of it that lies inside the window; an
/// open incident runs until `now`. The sum is clamped to the window length.
pub fn compute_uptime(
    incidents: &[Incident],
    now: DateTime<Utc>,
    window_hours: u32,
) -> UptimeReport {
    let window_seconds = f64::from(window_hours) * 3600.0;
    if window_seconds <= 0.0 {
        return UptimeReport {
            uptime_percentage: 100.0,
            total_downtime_seconds: 0,
            window_hours,
        };
    }

    let window_start = now - Duration::hours(i64::from(window_hours));

    let downtime: f64 = incidents
        .iter()
        .map(|incident| {
            let start = incident.started_at.max(window_start);
            let end = incident.resolved_at.unwrap_or(now).min(now);
            ((end - start).num_milliseconds() as f64 / 1000.0).max(0.0)
        })
        .sum();
    let downtime = downtime.min(window_seconds);

    let uptime = (1.0 - downtime / window_seconds) * 100.0;

    UptimeReport {
        uptime_percentage: (uptime * 10_000.0).round() / 10_000.0,
        total_downtime_seconds: downtime.round() as i64,
        window_hours,
    }
}

/// Load the overlapping incidents for a monitor and compute its uptime.
pub fn calculate_uptime(
    store: &Store,
    monitor_id: i64,
    window_hours: u32,
    now: DateTime<Utc>,
) -> Result<UptimeReport, DbError> {
    let window_start = now - Duration::hours(i64::from(window_hours));
    let incidents = store.get_overlapping_incidents(monitor_id, window_start, now)?;
    Ok(compute_uptime(&incidents, now, window_hours))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::RootCause;

    fn incident(started_at: DateTime<Utc>, resolved_at: Option<DateTime<Utc>>) -> Incident {
        Incident {
            id: 0,
            monitor_id: 1,
            started_at,
            resolved_at,
            duration_seconds: resolved_at.map(|r| (r - started_at).num_seconds()),
            root_cause: RootCause::Timeout,
        }
    }

    #[test]
    fn test_resolved_incident_inside_window() {
        let now = Utc::now();
        let report = compute_uptime(
            &[incident(now - Duration::hours(10), Some(now - Duration::hours(2)))],
            now,
            24,
        );
        assert!((report.uptime_percentage - 66.6667).abs() < 1e-9);
        assert_eq!(report.total_downtime_seconds, 8 * 3600);
        assert_eq!(report.window_hours, 24);
    }

    #[test]
    fn test_open_incident_counts_until_now() {
        let now = Utc::now();
        let report = compute_uptime(&[incident(now - Duration::hours(1), None)], now, 24);
        assert_eq!(report.total_downtime_seconds, 3600);
        assert!((report.uptime_percentage - 95.8333).abs() < 1e-9);
    }

    #[test]
    fn test_incident_straddling_window_start_is_clipped() {
        let now = Utc::now();
        let report = compute_uptime(
            &[incident(now - Duration::hours(30), Some(now - Duration::hours(23)))],
            now,
            24,
        );
        assert_eq!(report.total_downtime_seconds, 3600);
    }

    #[test]
    fn test_downtime_is_clamped_to_window() {
        let now = Utc::now();
        let report = compute_uptime(
            &[
                incident(now - Duration::hours(48), None),
                incident(now - Duration::hours(5), Some(now - Duration::hours(1))),
            ],
            now,
            24,
        );
        assert_eq!(report.total_downtime_seconds, 24 * 3600);
        assert_eq!(report.uptime_percentage, 0.0);
    }

    #[test]
    fn test_no_incidents_is_full_uptime() {
        let report = compute_uptime(&[], Utc::now(), 24);
        assert_eq!(report.uptime_percentage, 100.0);
        assert_eq!(report.total_downtime_seconds, 0);
    }

    #[test]
    fn test_zero_window() {
        let now = Utc::now();
        let report = compute_uptime(&[incident(now - Duration::hours(1), None)], now, 0);
        assert_eq!(report.uptime_percentage, 100.0);
    }

    #[test]
    fn test_calculate_from_store() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut monitor = crate::db::Monitor {
            owner: "ops@example.com".to_string(),
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        let id = store.add_monitor(&mut monitor).unwrap();

        let now = Utc::now();
        store.open_incident(id, RootCause::Timeout, now - Duration::hours(10)).unwrap();
        store.resolve_incident(id, now - Duration::hours(2)).unwrap();

        let report = calculate_uptime(&store, id, 24, now).unwrap();
        assert!((report.uptime_percentage - 66.6667).abs() < 1e-9);
    }
}
