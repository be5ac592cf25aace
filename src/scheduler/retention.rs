//! Retention manager for pruning old probe results.

use crate::db::Store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Deletes probe results older than the retention period. Incidents and
/// monitor state are never pruned.
pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: u32,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    /// `retention_days == 0` keeps everything.
    pub fn new(store: Arc<Store>, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        if self.retention_days == 0 {
            tracing::info!("RetentionManager: Retention disabled, keeping all probe results");
            return;
        }

        let store = self.store.clone();
        let stop = self.stop.clone();
        let retention_days = self.retention_days;

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention_days, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &Store, retention_days: u32, now: DateTime<Utc>) -> usize {
    let cutoff = now - ChronoDuration::days(i64::from(retention_days));

    match store.delete_probe_results_before(cutoff) {
        Ok(0) => 0,
        Ok(deleted) => {
            tracing::info!("RetentionManager: Deleted {} probe results before {}", deleted, cutoff);
            deleted
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to delete probe results: {}", e);
            0
        }
    }
}
