//! Command line: run the monitor, or manage monitors in the database.
//!
//! Admin commands only touch the store. A running instance picks up added,
//! changed and removed monitors on its next reconcile.

use crate::config::ServerConfig;
use crate::db::{DbError, MaintenanceWindow, Store};
use crate::monitor::IncidentManager;
use crate::notify::LogNotifier;
use crate::queue::MemoryQueue;
use crate::scheduler::{Scheduler, SchedulerError};

use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "uptrail")]
#[command(about = "HTTP(S) uptime monitoring with layered diagnosis")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Add a monitor
    Add {
        url: String,
        /// Owner email, receives certificate expiry alerts
        #[arg(long)]
        owner: String,
        /// Seconds between checks
        #[arg(long, default_value = "60")]
        interval: i64,
    },
    /// Change a monitor's URL and interval
    Update {
        id: i64,
        url: String,
        #[arg(long, default_value = "60")]
        interval: i64,
    },
    /// Delete a monitor and its history
    Remove { id: i64 },
    /// List monitors with their confirmed status
    List,
    /// Suppress alerts for a monitor starting now
    Maintenance {
        id: i64,
        #[arg(long, default_value = "60")]
        minutes: i64,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Check and incident summary over the last days
    Report {
        id: i64,
        #[arg(long, default_value = "7")]
        days: i64,
    },
    /// Incident history, newest first
    Incidents { id: i64 },
    /// Most recent check results
    Results {
        id: i64,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

/// Execute an admin command and return what should be printed.
pub async fn run_admin(
    command: Command,
    store: Arc<Store>,
    cfg: &ServerConfig,
) -> Result<String, CliError> {
    // Same validation path as the running service; the queue is discarded.
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(MemoryQueue::new()),
        Arc::new(LogNotifier),
        cfg,
    );

    match command {
        Command::Run => Ok(String::new()),
        Command::Add {
            url,
            owner,
            interval,
        } => {
            let monitor = scheduler.create_monitor(&owner, &url, interval).await?;
            Ok(format!("Added monitor {} ({})\n", monitor.id, monitor.url))
        }
        Command::Update { id, url, interval } => {
            let monitor = scheduler.update_monitor(id, &url, interval).await?;
            Ok(format!(
                "Updated monitor {}: {} every {}s\n",
                monitor.id, monitor.url, monitor.interval_seconds
            ))
        }
        Command::Remove { id } => {
            if scheduler.delete_monitor(id).await? {
                Ok(format!("Removed monitor {}\n", id))
            } else {
                Err(DbError::NotFound.into())
            }
        }
        Command::List => {
            let mut out = String::new();
            for m in store.get_monitors()? {
                out.push_str(&format!(
                    "{}\t{}\t{}\tevery {}s\t{}\n",
                    m.id, m.confirmed_status, m.url, m.interval_seconds, m.owner
                ));
            }
            Ok(out)
        }
        Command::Maintenance {
            id,
            minutes,
            reason,
        } => {
            if minutes <= 0 {
                return Err(CliError::NotPositive("minutes"));
            }
            store.get_monitor(id)?;
            let now = Utc::now();
            let mut window = MaintenanceWindow {
                id: 0,
                monitor_id: id,
                starts_at: now,
                ends_at: now + ChronoDuration::minutes(minutes),
                reason,
            };
            store.add_maintenance_window(&mut window)?;
            Ok(format!(
                "Alerts for monitor {} suppressed until {}\n",
                id, window.ends_at
            ))
        }
        Command::Report { id, days } => {
            if days <= 0 {
                return Err(CliError::NotPositive("days"));
            }
            let monitor = store.get_monitor(id)?;
            let now = Utc::now();
            let summary = store.period_summary(id, now - ChronoDuration::days(days), now)?;
            let hours = u32::try_from(days.saturating_mul(24)).unwrap_or(u32::MAX);
            let uptime = IncidentManager::new(store.clone()).uptime(id, hours)?;

            Ok(format!(
                "{} over the last {} days\n\
                 checks: {} ({} up, {:.2}%)\n\
                 uptime: {:.4}%\n\
                 incidents: {}, downtime {}s, longest {}s\n",
                monitor.url,
                days,
                summary.total_checks,
                summary.up_checks,
                summary.check_uptime_percentage,
                uptime.uptime_percentage,
                summary.incident_count,
                summary.total_downtime_seconds,
                summary.longest_outage_seconds
            ))
        }
        Command::Incidents { id } => {
            store.get_monitor(id)?;
            let incidents = IncidentManager::new(store.clone());
            let mut out = String::new();
            if let Some(open) = incidents.current(id)? {
                out.push_str(&format!(
                    "DOWN since {} ({})\n",
                    open.started_at, open.root_cause
                ));
            }
            for incident in incidents.history(id)? {
                let state = if incident.is_open() {
                    "open".to_string()
                } else {
                    format!("{}s", incident.duration_seconds.unwrap_or_default())
                };
                out.push_str(&format!(
                    "#{}\t{}\t{}\t{}\n",
                    incident.id, incident.started_at, incident.root_cause, state
                ));
            }
            Ok(out)
        }
        Command::Results { id, limit } => {
            if limit <= 0 {
                return Err(CliError::NotPositive("limit"));
            }
            store.get_monitor(id)?;
            let mut out = String::new();
            for r in store.get_probe_results(id, limit)? {
                out.push_str(&format!(
                    "{}\t{}\t{}\t{}\n",
                    r.checked_at,
                    r.status,
                    r.reason,
                    r.reason.message()
                ));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{CheckStatus, Reason, RootCause};
    use crate::db::ProbeRecord;
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, Arc<Store>, ServerConfig) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        (tmp, store, ServerConfig::default())
    }

    async fn add(store: &Arc<Store>, cfg: &ServerConfig, url: &str) -> i64 {
        let command = Command::Add {
            url: url.to_string(),
            owner: "ops@example.com".to_string(),
            interval: 30,
        };
        run_admin(command, store.clone(), cfg).await.unwrap();
        store.get_monitors().unwrap().last().unwrap().id
    }

    #[test]
    fn test_parse_subcommands() {
        let args = Args::try_parse_from(["uptrail"]).unwrap();
        assert_eq!(args.command, None);

        let args = Args::try_parse_from([
            "uptrail",
            "add",
            "https://example.com",
            "--owner",
            "ops@example.com",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Some(Command::Add {
                url: "https://example.com".to_string(),
                owner: "ops@example.com".to_string(),
                interval: 60,
            })
        );

        assert!(Args::try_parse_from(["uptrail", "add", "https://example.com"]).is_err());
    }

    #[tokio::test]
    async fn test_add_update_list_remove() {
        let (_tmp, store, cfg) = setup();
        let id = add(&store, &cfg, "https://example.com").await;

        let listed = run_admin(Command::List, store.clone(), &cfg).await.unwrap();
        assert!(listed.contains("https://example.com"));
        assert!(listed.contains("every 30s"));

        let update = Command::Update {
            id,
            url: "https://example.org".to_string(),
            interval: 120,
        };
        run_admin(update, store.clone(), &cfg).await.unwrap();
        let monitor = store.get_monitor(id).unwrap();
        assert_eq!(monitor.url, "https://example.org");
        assert_eq!(monitor.interval_seconds, 120);

        run_admin(Command::Remove { id }, store.clone(), &cfg).await.unwrap();
        assert!(store.get_monitors().unwrap().is_empty());

        let again = run_admin(Command::Remove { id }, store.clone(), &cfg).await;
        assert!(matches!(again, Err(CliError::Db(DbError::NotFound))));
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_url() {
        let (_tmp, store, cfg) = setup();
        let command = Command::Add {
            url: "not a url".to_string(),
            owner: "ops@example.com".to_string(),
            interval: 60,
        };
        let result = run_admin(command, store.clone(), &cfg).await;
        assert!(matches!(
            result,
            Err(CliError::Scheduler(SchedulerError::InvalidUrl(_)))
        ));
        assert!(store.get_monitors().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_window_gates_alerts() {
        let (_tmp, store, cfg) = setup();
        let id = add(&store, &cfg, "https://example.com").await;

        let command = Command::Maintenance {
            id,
            minutes: 30,
            reason: "database upgrade".to_string(),
        };
        run_admin(command, store.clone(), &cfg).await.unwrap();
        assert!(store.is_in_maintenance(id, Utc::now()).unwrap());

        let zero = Command::Maintenance {
            id,
            minutes: 0,
            reason: String::new(),
        };
        let result = run_admin(zero, store.clone(), &cfg).await;
        assert!(matches!(result, Err(CliError::NotPositive("minutes"))));

        let missing = Command::Maintenance {
            id: id + 100,
            minutes: 10,
            reason: String::new(),
        };
        let result = run_admin(missing, store.clone(), &cfg).await;
        assert!(matches!(result, Err(CliError::Db(DbError::NotFound))));
    }

    #[tokio::test]
    async fn test_report_and_incidents() {
        let (_tmp, store, cfg) = setup();
        let id = add(&store, &cfg, "https://example.com").await;

        let start = Utc::now() - ChronoDuration::hours(2);
        store.open_incident(id, RootCause::Http5xx, start).unwrap();
        store
            .resolve_incident(id, start + ChronoDuration::minutes(10))
            .unwrap();
        store
            .open_incident(id, RootCause::Timeout, Utc::now() - ChronoDuration::minutes(1))
            .unwrap();

        let report = run_admin(Command::Report { id, days: 1 }, store.clone(), &cfg)
            .await
            .unwrap();
        assert!(report.contains("checks: 0 (0 up, 100.00%)"));
        assert!(report.contains("incidents: 2, downtime 600s, longest 600s"));

        let incidents = run_admin(Command::Incidents { id }, store.clone(), &cfg)
            .await
            .unwrap();
        let lines: Vec<&str> = incidents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("DOWN since"));
        assert!(lines[1].ends_with("open"));
        assert!(lines[2].ends_with("600s"));
    }

    #[tokio::test]
    async fn test_results_explain_reason() {
        let (_tmp, store, cfg) = setup();
        let id = add(&store, &cfg, "https://example.com").await;
        store
            .add_probe_result(&ProbeRecord {
                id: 0,
                monitor_id: id,
                dns_ms: None,
                tcp_ms: None,
                tls_ms: None,
                ttfb_ms: None,
                status: CheckStatus::Down,
                reason: Reason::DnsFailure,
                root_cause: RootCause::DnsFailure,
                http_status: None,
                checked_at: Utc::now(),
            })
            .unwrap();

        let out = run_admin(Command::Results { id, limit: 5 }, store.clone(), &cfg)
            .await
            .unwrap();
        assert!(out.contains("DOWN\tDNS_FAILURE"));
        assert!(out.contains(Reason::DnsFailure.message()));
    }
}
