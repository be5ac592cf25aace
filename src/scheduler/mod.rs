//! Scheduler module: keeps one recurring check job per monitor and runs the
//! checks the queue hands out.

mod check;
mod retention;

pub use check::*;
pub use retention::*;

use crate::config::ServerConfig;
use crate::db::{DbError, Monitor, Store};
use crate::monitor::{HysteresisPolicy, IncidentManager};
use crate::notify::{MaintenanceGate, Notifier};
use crate::probe::{ProbeSettings, ProbeTarget};
use crate::queue::{CheckJob, JobQueue, QueueError};
use crate::tls_expiry::TlsExpiryTracker;

use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};

/// Upper bound of the random delay before each probe.
const MAX_JITTER_MS: u64 = 250;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Invalid monitor URL {0}")]
    InvalidUrl(String),
}

/// Queue key of a monitor's recurring check.
pub fn job_key(monitor_id: i64) -> String {
    format!("monitor:{}", monitor_id)
}

/// Orchestrates recurring checks for every persisted monitor.
pub struct Scheduler {
    store: Arc<Store>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    gate: Arc<dyn MaintenanceGate>,
    incidents: IncidentManager,
    tls: TlsExpiryTracker,
    settings: ProbeSettings,
    policy: HysteresisPolicy,
    concurrency: usize,
    poll_interval: Duration,
    reconcile_interval: Duration,
    retention_manager: Arc<RetentionManager>,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
        cfg: &ServerConfig,
    ) -> Self {
        let settings = cfg.probe_settings();
        let gate: Arc<dyn MaintenanceGate> = store.clone();

        Self {
            incidents: IncidentManager::new(store.clone()),
            tls: TlsExpiryTracker::new(store.clone(), settings.connect_timeout),
            retention_manager: Arc::new(RetentionManager::new(
                store.clone(),
                cfg.result_retention_days,
            )),
            store,
            queue,
            notifier,
            gate,
            settings,
            policy: HysteresisPolicy::default(),
            concurrency: cfg.worker_concurrency.max(1),
            poll_interval: cfg.poll_interval(),
            reconcile_interval: cfg.reconcile_interval(),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Create or replace the recurring check of a monitor.
    pub async fn schedule_monitor(
        &self,
        monitor_id: i64,
        url: &str,
        interval_seconds: i64,
    ) -> Result<(), QueueError> {
        let every = interval_seconds.max(1) as u64;
        let payload = CheckJob {
            monitor_id,
            url: url.to_string(),
            interval_seconds: every,
        };

        self.queue
            .upsert_scheduler(&job_key(monitor_id), Duration::from_secs(every), payload)
            .await?;
        tracing::info!("Scheduler: Scheduled monitor {} every {}s", monitor_id, every);
        Ok(())
    }

    /// Drop a monitor's recurring check together with any instance the queue
    /// already materialized for it. Returns how many pending instances were
    /// purged.
    pub async fn remove_monitor_job(&self, monitor_id: i64) -> Result<usize, QueueError> {
        let key = job_key(monitor_id);
        self.queue.remove_scheduler(&key).await?;

        let mut purged = 0;
        for job in self.queue.pending().await? {
            if job.key == key && self.queue.remove_pending(&job.id).await? {
                purged += 1;
            }
        }

        tracing::info!(
            "Scheduler: Removed monitor {} ({} pending instance(s) purged)",
            monitor_id,
            purged
        );
        Ok(purged)
    }

    /// Make the queue match the store: every persisted monitor gets its
    /// schedule, and schedules of monitors that no longer exist are removed.
    ///
    /// A schedule that already matches the monitor is left alone so its next
    /// run keeps its place. Returns the number of schedules written or removed.
    pub async fn reconcile(&self) -> Result<usize, SchedulerError> {
        let monitors = self.store.get_monitors()?;
        let existing = self.queue.schedulers().await?;
        let mut changed = 0;

        for monitor in &monitors {
            let key = job_key(monitor.id);
            let every = Duration::from_secs(monitor.interval_seconds.max(1) as u64);
            let current = existing.iter().any(|entry| {
                entry.key == key && entry.every == every && entry.payload.url == monitor.url
            });
            if !current {
                self.schedule_monitor(monitor.id, &monitor.url, monitor.interval_seconds)
                    .await?;
                changed += 1;
            }
        }

        let live: HashSet<i64> = monitors.iter().map(|m| m.id).collect();
        for entry in &existing {
            if !live.contains(&entry.payload.monitor_id) {
                self.remove_monitor_job(entry.payload.monitor_id).await?;
                changed += 1;
            }
        }

        if changed > 0 {
            tracing::info!(
                "Scheduler: Reconciled {} monitors ({} schedules changed)",
                monitors.len(),
                changed
            );
        }
        Ok(changed)
    }

    pub async fn create_monitor(
        &self,
        owner: &str,
        url: &str,
        interval_seconds: i64,
    ) -> Result<Monitor, SchedulerError> {
        ProbeTarget::parse(url).map_err(|_| SchedulerError::InvalidUrl(url.to_string()))?;

        let mut monitor = Monitor {
            owner: owner.to_string(),
            url: url.to_string(),
            interval_seconds: interval_seconds.max(1),
            ..Default::default()
        };
        self.store.add_monitor(&mut monitor)?;
        self.schedule_monitor(monitor.id, &monitor.url, monitor.interval_seconds)
            .await?;
        Ok(monitor)
    }

    pub async fn update_monitor(
        &self,
        id: i64,
        url: &str,
        interval_seconds: i64,
    ) -> Result<Monitor, SchedulerError> {
        ProbeTarget::parse(url).map_err(|_| SchedulerError::InvalidUrl(url.to_string()))?;

        let monitor = self.store.update_monitor(id, url, interval_seconds.max(1))?;
        self.schedule_monitor(monitor.id, &monitor.url, monitor.interval_seconds)
            .await?;
        Ok(monitor)
    }

    /// Unschedule first so no new instance can fire, then delete the row.
    pub async fn delete_monitor(&self, id: i64) -> Result<bool, SchedulerError> {
        self.remove_monitor_job(id).await?;
        Ok(self.store.delete_monitor(id)?)
    }

    /// Reconcile schedules, then start the worker loop and the retention
    /// manager.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let scheduled = self.reconcile().await?;
        tracing::info!("Scheduler: {} schedules issued at startup", scheduled);

        let (tx, rx) = broadcast::channel(1);
        {
            let mut stop_guard = self.stop.lock().await;
            *stop_guard = Some(tx);
        }

        self.retention_manager.start();
        tokio::spawn(run_worker(self.clone(), rx));

        tracing::info!(
            "Scheduler: Worker started (concurrency {}, poll every {:?})",
            self.concurrency,
            self.poll_interval
        );
        Ok(())
    }

    /// Stop taking new jobs. Checks already running are allowed to finish.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
        drop(stop);
        self.retention_manager.stop().await;
    }
}

/// Poll the queue and run due checks, at most `concurrency` at a time.
///
/// Also re-runs [`Scheduler::reconcile`] periodically so monitors changed
/// from the command line are picked up.
async fn run_worker(scheduler: Arc<Scheduler>, mut stop_rx: broadcast::Receiver<()>) {
    let semaphore = Arc::new(Semaphore::new(scheduler.concurrency));

    let mut interval = tokio::time::interval(scheduler.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let first_reconcile = tokio::time::Instant::now() + scheduler.reconcile_interval;
    let mut reconcile = tokio::time::interval_at(first_reconcile, scheduler.reconcile_interval);
    reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = reconcile.tick() => {
                if let Err(e) = scheduler.reconcile().await {
                    tracing::error!("Scheduler: Reconcile failed: {}", e);
                }
            }
            _ = interval.tick() => {
                let due = match scheduler.queue.take_due(Utc::now()).await {
                    Ok(jobs) => jobs,
                    Err(QueueError::Closed) => {
                        tracing::info!("Scheduler: Queue closed, worker exiting");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Scheduler: Failed to poll queue: {}", e);
                        continue;
                    }
                };

                for job in due {
                    // Wait for a slot; due jobs are never dropped.
                    let Some(permit) = acquire_or_stop(&semaphore, &mut stop_rx).await else {
                        tracing::info!("Scheduler: Stopped while waiting for a worker slot");
                        return;
                    };

                    let scheduler = scheduler.clone();
                    tokio::spawn(async move {
                        let _permit = permit;

                        let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;

                        match scheduler.run_check(&job.payload).await {
                            Ok(_) => {}
                            Err(CheckError::StaleJob(monitor_id)) => {
                                tracing::warn!(
                                    "Discarding job {} for deleted monitor {}",
                                    job.id,
                                    monitor_id
                                );
                            }
                            Err(e) => {
                                tracing::error!("Check failed for {}: {}", job.payload.url, e);
                            }
                        }
                    });
                }
            }
        }
    }
}

/// Wait for a worker slot unless a stop arrives first.
async fn acquire_or_stop(
    semaphore: &Arc<Semaphore>,
    stop_rx: &mut broadcast::Receiver<()>,
) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        _ = stop_rx.recv() => None,
        permit = semaphore.clone().acquire_owned() => permit.ok(),
    }
}
