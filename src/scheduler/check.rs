//! One full check pass for a monitor.

use super::Scheduler;
use crate::analysis::{classify_root_cause, diagnose};
use crate::db::{CheckOutcome, DbError, Monitor, ProbeRecord};
use crate::monitor::Transition;
use crate::notify::{ExpiryAlert, StatusAlert};
use crate::probe::run_full_probe;
use crate::queue::CheckJob;
use crate::tls_expiry::ExpiryError;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckError {
    /// The job names a monitor that has since been deleted.
    #[error("monitor {0} no longer exists")]
    StaleJob(i64),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl Scheduler {
    /// Probe the monitor, classify the result, advance its state and
    /// incidents, then dispatch any alerts.
    ///
    /// Alerts are only sent once the state change has been committed.
    pub async fn run_check(&self, job: &CheckJob) -> Result<CheckOutcome, CheckError> {
        let monitor = self
            .store
            .find_monitor(job.monitor_id)?
            .ok_or(CheckError::StaleJob(job.monitor_id))?;

        let report = run_full_probe(&monitor.url, &self.settings).await;
        let diagnosis = diagnose(&report);
        let root_cause = classify_root_cause(&report);
        let checked_at = Utc::now();

        tracing::debug!(
            "Check {}: {} ({}, root cause {})",
            monitor.url,
            diagnosis.status,
            diagnosis.reason,
            root_cause
        );

        let record =
            ProbeRecord::from_report(monitor.id, &report, &diagnosis, root_cause, checked_at);
        // Deleted while the probe was in flight.
        let outcome = match self.store.apply_check(&record, &self.policy) {
            Err(DbError::NotFound) => return Err(CheckError::StaleJob(monitor.id)),
            result => result?,
        };

        if outcome.transition.is_change() {
            self.dispatch_status(&outcome, checked_at).await;
        }

        if report.tls_required {
            self.track_certificate(&outcome.monitor).await?;
        }

        Ok(outcome)
    }

    async fn dispatch_status(&self, outcome: &CheckOutcome, checked_at: DateTime<Utc>) {
        let monitor = &outcome.monitor;

        match (outcome.transition, &outcome.incident) {
            (Transition::Unchanged, _) => return,
            (Transition::WentDown, Some(incident)) => tracing::warn!(
                "Monitor {} confirmed DOWN, incident {} opened ({})",
                monitor.url,
                incident.id,
                incident.root_cause
            ),
            (Transition::WentDown, None) => {
                tracing::warn!("Monitor {} confirmed DOWN", monitor.url)
            }
            (Transition::Recovered, incident) => {
                if let Some(incident) = incident {
                    tracing::info!(
                        "Incident {} resolved after {}s",
                        incident.id,
                        incident.duration_seconds.unwrap_or_default()
                    );
                }
                match self.incidents.uptime(monitor.id, 24) {
                    Ok(report) => tracing::info!(
                        "Monitor {} recovered, 24h uptime {:.4}%",
                        monitor.url,
                        report.uptime_percentage
                    ),
                    Err(e) => {
                        tracing::warn!("Failed to compute uptime for {}: {}", monitor.url, e)
                    }
                }
            }
        }

        if self.suppressed_by_maintenance(monitor.id, checked_at) {
            tracing::info!("Monitor {} is in maintenance, status alert suppressed", monitor.url);
            return;
        }

        let alert = StatusAlert {
            monitor_id: monitor.id,
            url: monitor.url.clone(),
            status: monitor.confirmed_status,
            checked_at,
        };
        if let Err(e) = self.notifier.send_status(&alert).await {
            tracing::error!("Failed to deliver status alert for {}: {}", monitor.url, e);
        }
    }

    async fn track_certificate(&self, monitor: &Monitor) -> Result<(), CheckError> {
        let now = Utc::now();
        let result = self.tls.check(monitor, now).await;
        self.handle_expiry(monitor, result, now).await
    }

    /// Dispatch the outcome of an expiry cycle. A failed TLS probe is logged
    /// and leaves the stored state as it was.
    async fn handle_expiry(
        &self,
        monitor: &Monitor,
        result: Result<Option<ExpiryAlert>, ExpiryError>,
        now: DateTime<Utc>,
    ) -> Result<(), CheckError> {
        let alert = match result {
            Ok(Some(alert)) => alert,
            Ok(None) => return Ok(()),
            Err(ExpiryError::Probe(e)) => {
                tracing::warn!("TLS expiry check failed for {}: {}", monitor.url, e);
                return Ok(());
            }
            Err(ExpiryError::Db(DbError::NotFound)) => {
                return Err(CheckError::StaleJob(monitor.id))
            }
            Err(ExpiryError::Db(e)) => return Err(e.into()),
        };

        self.dispatch_expiry(&alert, now).await;
        Ok(())
    }

    /// The threshold is already recorded; maintenance only stops delivery.
    async fn dispatch_expiry(&self, alert: &ExpiryAlert, now: DateTime<Utc>) {
        if self.suppressed_by_maintenance(alert.monitor_id, now) {
            tracing::info!("Monitor {} is in maintenance, expiry alert suppressed", alert.url);
            return;
        }

        if let Err(e) = self.notifier.send_expiry(alert).await {
            tracing::error!("Failed to deliver expiry alert for {}: {}", alert.url, e);
        }
    }

    fn suppressed_by_maintenance(&self, monitor_id: i64, now: DateTime<Utc>) -> bool {
        match self.gate.in_maintenance(monitor_id, now) {
            Ok(in_maintenance) => in_maintenance,
            Err(e) => {
                // Over-alerting beats a silent outage.
                tracing::warn!("Maintenance lookup failed for monitor {}: {}", monitor_id, e);
                false
            }
        }
    }
}
