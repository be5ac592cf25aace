//! Certificate expiry tracking.
//!
//! Runs its own handshake to read the leaf certificate's `notAfter` and
//! raises at most one alert per threshold for each certificate lifetime.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::db::{DbError, Monitor, Store};
use crate::notify::ExpiryAlert;
use crate::probe::{peer_certificate_expiry, tls_handshake, ProbeTarget, StageFailure};

/// Days-left thresholds that raise an alert, smallest first.
pub const ALERT_THRESHOLDS_DAYS: [u32; 3] = [1, 3, 7];

/// Expiry check failed; the previously stored state is left untouched.
#[derive(Error, Debug)]
pub enum TlsProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake failed: {}", .0.as_str())]
    Handshake(StageFailure),
    #[error("certificate unreadable: {0}")]
    Certificate(String),
}

#[derive(Error, Debug)]
pub enum ExpiryError {
    #[error("TLS expiry probe failed: {0}")]
    Probe(#[from] TlsProbeError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Result of evaluating the days left against the alerted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryEvaluation {
    pub alerted_days: BTreeSet<u32>,
    /// Threshold to alert on now, if any.
    pub fire: Option<u32>,
}

/// Fractional days between `now` and `expiry`; negative once expired.
pub fn days_left(expiry: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (expiry - now).num_seconds() as f64 / 86_400.0
}

/// Decide whether a threshold alert is due.
///
/// More than seven days left means a fresh certificate, so the alerted set
/// is cleared. Otherwise the smallest crossed threshold not yet alerted
/// fires and is added to the set.
pub fn evaluate_expiry(days_left: f64, alerted: &BTreeSet<u32>) -> ExpiryEvaluation {
    let largest = ALERT_THRESHOLDS_DAYS[ALERT_THRESHOLDS_DAYS.len() - 1];
    if days_left > f64::from(largest) {
        return ExpiryEvaluation {
            alerted_days: BTreeSet::new(),
            fire: None,
        };
    }

    let fire = ALERT_THRESHOLDS_DAYS
        .iter()
        .copied()
        .find(|threshold| days_left <= f64::from(*threshold) && !alerted.contains(threshold));

    let mut alerted_days = alerted.clone();
    if let Some(threshold) = fire {
        alerted_days.insert(threshold);
    }

    ExpiryEvaluation { alerted_days, fire }
}

/// Connect, handshake with SNI and return the leaf certificate's expiry.
pub async fn fetch_certificate_expiry(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<DateTime<Utc>, TlsProbeError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TlsProbeError::Timeout(timeout))?
        .map_err(|e| TlsProbeError::Connect(e.to_string()))?;

    let tls = tls_handshake(stream, host, timeout)
        .await
        .map_err(TlsProbeError::Handshake)?;

    peer_certificate_expiry(&tls).map_err(|e| TlsProbeError::Certificate(e.to_string()))
}

/// Tracks certificate lifetime for HTTPS monitors.
#[derive(Clone)]
pub struct TlsExpiryTracker {
    store: Arc<Store>,
    timeout: Duration,
}

impl TlsExpiryTracker {
    pub fn new(store: Arc<Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Run one expiry cycle for the monitor.
    ///
    /// The new state is persisted before the alert is handed back for
    /// dispatch. Plain HTTP monitors are skipped.
    pub async fn check(
        &self,
        monitor: &Monitor,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiryAlert>, ExpiryError> {
        let target = match ProbeTarget::parse(&monitor.url) {
            Ok(t) if t.tls => t,
            _ => return Ok(None),
        };

        let expiry = fetch_certificate_expiry(&target.host, target.port, self.timeout).await?;
        self.record_expiry(monitor, expiry, now)
    }

    /// Fold a freshly read expiry into the monitor's stored TLS state.
    ///
    /// `monitor` carries the alerted set this check started from. If another
    /// check has written the set since, nothing is stored and no alert is
    /// returned.
    pub fn record_expiry(
        &self,
        monitor: &Monitor,
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiryAlert>, ExpiryError> {
        let remaining = days_left(expiry, now);
        let evaluation = evaluate_expiry(remaining, &monitor.tls_alerted_days);

        let stored = self.store.update_tls_state(
            monitor.id,
            Some(expiry),
            &monitor.tls_alerted_days,
            &evaluation.alerted_days,
        )?;
        if !stored {
            tracing::debug!("TLS state of {} changed by a concurrent check", monitor.url);
            return Ok(None);
        }

        if monitor.tls_alerted_days.len() > evaluation.alerted_days.len() {
            tracing::info!("Certificate for {} renewed, expires {}", monitor.url, expiry);
        }

        Ok(evaluation.fire.map(|threshold| {
            tracing::info!(
                "Certificate for {} expires in {:.1} days (threshold {}d)",
                monitor.url,
                remaining,
                threshold
            );
            ExpiryAlert {
                monitor_id: monitor.id,
                email: monitor.owner.clone(),
                url: monitor.url.clone(),
                expiry_date: expiry,
                days_left: remaining.floor() as i64,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn set(days: &[u32]) -> BTreeSet<u32> {
        days.iter().copied().collect()
    }

    #[test]
    fn test_five_days_fires_only_seven() {
        let first = evaluate_expiry(5.0, &BTreeSet::new());
        assert_eq!(first.fire, Some(7));
        assert_eq!(first.alerted_days, set(&[7]));

        let repeat = evaluate_expiry(5.0, &first.alerted_days);
        assert_eq!(repeat.fire, None);
        assert_eq!(repeat.alerted_days, set(&[7]));

        let renewed = evaluate_expiry(9.0, &repeat.alerted_days);
        assert_eq!(renewed.fire, None);
        assert!(renewed.alerted_days.is_empty());
    }

    #[test]
    fn test_thresholds_fire_in_turn() {
        let seven = evaluate_expiry(6.5, &BTreeSet::new());
        assert_eq!(seven.fire, Some(7));
        let three = evaluate_expiry(2.5, &seven.alerted_days);
        assert_eq!(three.fire, Some(3));
        assert_eq!(three.alerted_days, set(&[3, 7]));
        let one = evaluate_expiry(0.5, &three.alerted_days);
        assert_eq!(one.fire, Some(1));
        assert_eq!(one.alerted_days, set(&[1, 3, 7]));
        assert_eq!(evaluate_expiry(0.2, &one.alerted_days).fire, None);
    }

    #[test]
    fn test_first_seen_near_expiry_catches_up_one_threshold_per_check() {
        let first = evaluate_expiry(2.5, &BTreeSet::new());
        assert_eq!(first.fire, Some(3));
        assert_eq!(first.alerted_days, set(&[3]));

        // The larger threshold is still owed and fires on the next check.
        let second = evaluate_expiry(2.4, &first.alerted_days);
        assert_eq!(second.fire, Some(7));
        assert_eq!(second.alerted_days, set(&[3, 7]));

        assert_eq!(evaluate_expiry(2.3, &second.alerted_days).fire, None);
    }

    #[test]
    fn test_expired_certificate_crosses_every_threshold() {
        let evaluation = evaluate_expiry(-2.0, &BTreeSet::new());
        assert_eq!(evaluation.fire, Some(1));
    }

    #[test]
    fn test_exact_threshold_counts_as_crossed() {
        assert_eq!(evaluate_expiry(7.0, &BTreeSet::new()).fire, Some(7));
        assert_eq!(evaluate_expiry(7.01, &BTreeSet::new()).fire, None);
    }

    #[test]
    fn test_days_left() {
        let now = Utc::now();
        assert_eq!(days_left(now + ChronoDuration::days(3), now), 3.0);
        assert!(days_left(now - ChronoDuration::hours(12), now) < 0.0);
    }

    #[test]
    fn test_record_expiry_persists_before_alerting() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut monitor = Monitor {
            owner: "ops@example.com".to_string(),
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        store.add_monitor(&mut monitor).unwrap();

        let tracker = TlsExpiryTracker::new(store.clone(), Duration::from_secs(1));
        let now = Utc::now();
        let expiry = now + ChronoDuration::days(5);

        let alert = tracker.record_expiry(&monitor, expiry, now).unwrap().unwrap();
        assert_eq!(alert.email, "ops@example.com");
        assert_eq!(alert.days_left, 5);

        let stored = store.get_monitor(monitor.id).unwrap();
        assert_eq!(stored.tls_alerted_days, set(&[7]));
        assert_eq!(stored.tls_expiry_at.map(|e| e.timestamp()), Some(expiry.timestamp()));

        // Same certificate on the next cycle: nothing new.
        assert!(tracker.record_expiry(&stored, expiry, now).unwrap().is_none());
    }

    #[test]
    fn test_record_expiry_for_deleted_monitor() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let monitor = Monitor {
            id: 42,
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        let tracker = TlsExpiryTracker::new(store, Duration::from_secs(1));

        let result = tracker.record_expiry(&monitor, Utc::now(), Utc::now());
        assert!(matches!(result, Err(ExpiryError::Db(DbError::NotFound))));
    }

    #[tokio::test]
    async fn test_plain_http_monitor_is_skipped() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let monitor = Monitor {
            id: 1,
            url: "http://example.com".to_string(),
            ..Default::default()
        };
        let tracker = TlsExpiryTracker::new(store, Duration::from_secs(1));
        assert!(tracker.check(&monitor, Utc::now()).await.unwrap().is_none());
    }

    #[test]
    fn test_concurrent_write_wins_and_suppresses_duplicate() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut monitor = Monitor {
            owner: "ops@example.com".to_string(),
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        store.add_monitor(&mut monitor).unwrap();

        let tracker = TlsExpiryTracker::new(store.clone(), Duration::from_secs(1));
        let now = Utc::now();
        let expiry = now + ChronoDuration::days(5);

        // Two overlapping checks both started from the empty set.
        let first = tracker.record_expiry(&monitor, expiry, now).unwrap();
        let second = tracker.record_expiry(&monitor, expiry, now).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.get_monitor(monitor.id).unwrap().tls_alerted_days, set(&[7]));
    }

    #[tokio::test]
    async fn test_failed_check_leaves_stored_state_untouched() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut monitor = Monitor {
            owner: "ops@example.com".to_string(),
            url: format!("https://127.0.0.1:{}/", port),
            ..Default::default()
        };
        store.add_monitor(&mut monitor).unwrap();
        let expiry = Utc::now() + ChronoDuration::days(2);
        assert!(store
            .update_tls_state(monitor.id, Some(expiry), &BTreeSet::new(), &set(&[3]))
            .unwrap());
        let before = store.get_monitor(monitor.id).unwrap();

        let tracker = TlsExpiryTracker::new(store.clone(), Duration::from_secs(1));
        let result = tracker.check(&before, Utc::now()).await;
        assert!(matches!(result, Err(ExpiryError::Probe(_))));

        let after = store.get_monitor(monitor.id).unwrap();
        assert_eq!(after.tls_alerted_days, set(&[3]));
        assert_eq!(after.tls_expiry_at, before.tls_expiry_at);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_tls_error() {
        let result = fetch_certificate_expiry("127.0.0.1", 1, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TlsProbeError::Connect(_)) | Err(TlsProbeError::Timeout(_))));
    }
}
