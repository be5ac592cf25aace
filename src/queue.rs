//! Recurring job queue.
//!
//! The orchestrator only talks to [`JobQueue`]: upsert and remove recurring
//! schedulers by key, enumerate the delayed instances they have already
//! materialized, and receive due instances with at-least-once delivery.
//! [`MemoryQueue`] is the in-process implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("invalid repeat interval")]
    InvalidInterval,
}

/// Payload carried by every check job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckJob {
    pub monitor_id: i64,
    pub url: String,
    pub interval_seconds: u64,
}

/// A materialized instance of a recurring scheduler, waiting to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedJob {
    /// `repeat:<key>:<millis>`
    pub id: String,
    pub key: String,
    pub run_at: DateTime<Utc>,
    pub payload: CheckJob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerEntry {
    pub key: String,
    pub every: Duration,
    pub payload: CheckJob,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create or replace the recurring scheduler under `key`. The first
    /// instance is due immediately.
    async fn upsert_scheduler(
        &self,
        key: &str,
        every: Duration,
        payload: CheckJob,
    ) -> Result<(), QueueError>;

    /// Delete the recurring scheduler. Instances it already materialized are
    /// left in place.
    async fn remove_scheduler(&self, key: &str) -> Result<bool, QueueError>;

    async fn schedulers(&self) -> Result<Vec<SchedulerEntry>, QueueError>;

    /// Delayed instances not yet handed out.
    async fn pending(&self) -> Result<Vec<DelayedJob>, QueueError>;

    async fn remove_pending(&self, job_id: &str) -> Result<bool, QueueError>;

    /// Hand out every instance due at `now` and materialize the next instance
    /// of each live scheduler.
    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<DelayedJob>, QueueError>;

    async fn close(&self);
}

fn job_id(key: &str, run_at: DateTime<Utc>) -> String {
    format!("repeat:{}:{}", key, run_at.timestamp_millis())
}

#[derive(Default)]
struct QueueState {
    schedulers: HashMap<String, SchedulerEntry>,
    pending: Vec<DelayedJob>,
    closed: bool,
}

impl QueueState {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    fn materialize(&mut self, entry: &SchedulerEntry, run_at: DateTime<Utc>) {
        self.pending.push(DelayedJob {
            id: job_id(&entry.key, run_at),
            key: entry.key.clone(),
            run_at,
            payload: entry.payload.clone(),
        });
    }
}

/// In-process [`JobQueue`]. Nothing survives a restart; the store is
/// authoritative and the orchestrator reconciles on startup.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn upsert_scheduler(
        &self,
        key: &str,
        every: Duration,
        payload: CheckJob,
    ) -> Result<(), QueueError> {
        if every.is_zero() {
            return Err(QueueError::InvalidInterval);
        }

        let mut state = self.state.lock().await;
        state.ensure_open()?;

        // The replaced scheduler's next instance goes with it.
        state.pending.retain(|job| job.key != key);

        let entry = SchedulerEntry {
            key: key.to_string(),
            every,
            payload,
        };
        state.materialize(&entry, Utc::now());
        state.schedulers.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove_scheduler(&self, key: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state.schedulers.remove(key).is_some())
    }

    async fn schedulers(&self) -> Result<Vec<SchedulerEntry>, QueueError> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        let mut entries: Vec<_> = state.schedulers.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn pending(&self) -> Result<Vec<DelayedJob>, QueueError> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state.pending.clone())
    }

    async fn remove_pending(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        let before = state.pending.len();
        state.pending.retain(|job| job.id != job_id);
        Ok(state.pending.len() < before)
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<DelayedJob>, QueueError> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let (mut due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|job| job.run_at <= now);
        state.pending = waiting;
        due.sort_by_key(|job| job.run_at);

        for job in &due {
            let Some(entry) = state.schedulers.get(&job.key).cloned() else {
                continue;
            };
            if state.pending.iter().any(|p| p.key == job.key) {
                continue;
            }
            let every = chrono::Duration::from_std(entry.every)
                .unwrap_or(chrono::Duration::seconds(60));
            let mut next = job.run_at + every;
            if next <= now {
                // Missed ticks are skipped rather than fired in a burst.
                next = now + every;
            }
            state.materialize(&entry, next);
        }

        Ok(due)
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}
