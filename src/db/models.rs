//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::analysis::{CheckStatus, Diagnosis, Reason, RootCause};
use crate::monitor::{MonitorState, MonitorStatus, Transition};
use crate::probe::ProbeReport;

/// A monitored endpoint and its persisted check state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i64,
    /// Email address of the owner; receives certificate expiry alerts.
    pub owner: String,
    pub url: String,
    pub interval_seconds: i64,
    pub confirmed_status: MonitorStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub tls_expiry_at: Option<DateTime<Utc>>,
    /// Expiry thresholds (in days) already alerted for the current certificate.
    pub tls_alerted_days: BTreeSet<u32>,
    pub created_at: DateTime<Utc>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            id: 0,
            owner: String::new(),
            url: String::new(),
            interval_seconds: 60,
            confirmed_status: MonitorStatus::Up,
            consecutive_failures: 0,
            consecutive_successes: 0,
            tls_expiry_at: None,
            tls_alerted_days: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }
}

impl Monitor {
    pub fn state(&self) -> MonitorState {
        MonitorState {
            confirmed: self.confirmed_status,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
        }
    }
}

/// One row of the append-only probe log.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    pub id: i64,
    pub monitor_id: i64,
    pub dns_ms: Option<u64>,
    pub tcp_ms: Option<u64>,
    pub tls_ms: Option<u64>,
    pub ttfb_ms: Option<u64>,
    pub status: CheckStatus,
    pub reason: Reason,
    pub root_cause: RootCause,
    pub http_status: Option<u16>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeRecord {
    pub fn from_report(
        monitor_id: i64,
        report: &ProbeReport,
        diagnosis: &Diagnosis,
        root_cause: RootCause,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            monitor_id,
            dns_ms: report.dns.elapsed_ms(),
            tcp_ms: report.tcp.elapsed_ms(),
            tls_ms: report.tls.elapsed_ms(),
            ttfb_ms: report.http.elapsed_ms(),
            status: diagnosis.status,
            reason: diagnosis.reason,
            root_cause,
            http_status: report.status_code,
            checked_at,
        }
    }
}

/// A confirmed outage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: i64,
    pub monitor_id: i64,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub root_cause: RootCause,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// A declared range during which alerts for a monitor are suppressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: i64,
    pub monitor_id: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub reason: String,
}

/// What a single check changed, returned once the write has committed.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// The monitor as it is after the check.
    pub monitor: Monitor,
    pub transition: Transition,
    /// The incident opened or resolved by this check, if any.
    pub incident: Option<Incident>,
}

/// Aggregates over a reporting period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSummary {
    pub total_checks: i64,
    pub up_checks: i64,
    /// Share of checks classified UP; 100 when there were no checks.
    pub check_uptime_percentage: f64,
    pub incident_count: i64,
    pub total_downtime_seconds: i64,
    pub longest_outage_seconds: i64,
}
