//! Alert dispatch and the maintenance gate.
//!
//! Delivery itself lives outside the core: a [`Notifier`] acknowledges each
//! event, and the [`MaintenanceGate`] decides whether an alert is sent at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::db::{DbError, Store};
use crate::monitor::MonitorStatus;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("receiver rejected alert with status {0}")]
    Rejected(u16),
}

/// Confirmed status change of a monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusAlert {
    pub monitor_id: i64,
    pub url: String,
    pub status: MonitorStatus,
    pub checked_at: DateTime<Utc>,
}

/// Certificate crossed an expiry threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryAlert {
    #[serde(skip)]
    pub monitor_id: i64,
    pub email: String,
    pub url: String,
    pub expiry_date: DateTime<Utc>,
    pub days_left: i64,
}

/// Delivers alerts. `Ok` acknowledges delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_status(&self, alert: &StatusAlert) -> Result<(), NotifyError>;
    async fn send_expiry(&self, alert: &ExpiryAlert) -> Result<(), NotifyError>;
}

/// "Is this monitor under maintenance right now?"
pub trait MaintenanceGate: Send + Sync {
    fn in_maintenance(&self, monitor_id: i64, now: DateTime<Utc>) -> Result<bool, DbError>;
}

impl MaintenanceGate for Store {
    fn in_maintenance(&self, monitor_id: i64, now: DateTime<Utc>) -> Result<bool, DbError> {
        self.is_in_maintenance(monitor_id, now)
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_status(&self, alert: &StatusAlert) -> Result<(), NotifyError> {
        match alert.status {
            MonitorStatus::Down => {
                tracing::warn!("ALERT: {} is DOWN (checked {})", alert.url, alert.checked_at)
            }
            MonitorStatus::Up => {
                tracing::info!("RECOVERY: {} is back UP (checked {})", alert.url, alert.checked_at)
            }
        }
        Ok(())
    }

    async fn send_expiry(&self, alert: &ExpiryAlert) -> Result<(), NotifyError> {
        tracing::warn!(
            "CERTIFICATE: {} expires {} ({} days left), owner {}",
            alert.url,
            alert.expiry_date,
            alert.days_left,
            alert.email
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WebhookPayload<'a> {
    Status(&'a StatusAlert),
    CertificateExpiry(&'a ExpiryAlert),
}

/// POSTs each alert as JSON to a webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_status(&self, alert: &StatusAlert) -> Result<(), NotifyError> {
        self.post(&WebhookPayload::Status(alert)).await
    }

    async fn send_expiry(&self, alert: &ExpiryAlert) -> Result<(), NotifyError> {
        self.post(&WebhookPayload::CertificateExpiry(alert)).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every alert it is given.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub statuses: Mutex<Vec<StatusAlert>>,
        pub expiries: Mutex<Vec<ExpiryAlert>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_status(&self, alert: &StatusAlert) -> Result<(), NotifyError> {
            self.statuses.lock().unwrap().push(alert.clone());
            Ok(())
        }

        async fn send_expiry(&self, alert: &ExpiryAlert) -> Result<(), NotifyError> {
            self.expiries.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }
}
