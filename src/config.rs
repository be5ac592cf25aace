//! Configuration module for Uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::probe::ProbeSettings;

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Maximum number of checks running at once (default: 2)
    pub worker_concurrency: usize,
    /// Bound for DNS resolution in seconds (default: 5)
    pub dns_timeout_secs: u64,
    /// Bound for TCP connect and TLS handshake in seconds (default: 5)
    pub connect_timeout_secs: u64,
    /// Bound for the HTTP stage in seconds (default: 10)
    pub http_timeout_secs: u64,
    /// How often the worker polls the job queue, in milliseconds (default: 500)
    pub poll_interval_ms: u64,
    /// How often the store is re-read for added, changed or removed
    /// monitors, in seconds (default: 30)
    pub reconcile_interval_secs: u64,
    /// Days of probe results to keep; 0 keeps everything (default: 30)
    pub result_retention_days: u32,
    /// Optional webhook that receives alerts as JSON
    pub webhook_url: Option<String>,
    /// Monitor inserted on first start when the store is empty
    pub seed_url: Option<String>,
    pub seed_owner: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "uptrail.db".to_string(),
            worker_concurrency: 2,
            dns_timeout_secs: 5,
            connect_timeout_secs: 5,
            http_timeout_secs: 10,
            poll_interval_ms: 500,
            reconcile_interval_secs: 30,
            result_retention_days: 30,
            webhook_url: None,
            seed_url: None,
            seed_owner: "admin@localhost".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_WORKER_CONCURRENCY`: Checks in flight (default: 2)
    /// - `UPTRAIL_DNS_TIMEOUT_SECS`: DNS bound (default: 5)
    /// - `UPTRAIL_CONNECT_TIMEOUT_SECS`: TCP/TLS bound (default: 5)
    /// - `UPTRAIL_HTTP_TIMEOUT_SECS`: HTTP bound (default: 10)
    /// - `UPTRAIL_POLL_INTERVAL_MS`: Queue poll interval (default: 500)
    /// - `UPTRAIL_RECONCILE_INTERVAL_SECS`: Store re-read interval (default: 30)
    /// - `UPTRAIL_RESULT_RETENTION_DAYS`: Probe result retention (default: 30)
    /// - `UPTRAIL_WEBHOOK_URL`: Alert webhook (default: unset, alerts are logged)
    /// - `UPTRAIL_SEED_URL` / `UPTRAIL_SEED_OWNER`: First-run monitor
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        parse_var("UPTRAIL_WORKER_CONCURRENCY", &mut cfg.worker_concurrency);
        parse_var("UPTRAIL_DNS_TIMEOUT_SECS", &mut cfg.dns_timeout_secs);
        parse_var("UPTRAIL_CONNECT_TIMEOUT_SECS", &mut cfg.connect_timeout_secs);
        parse_var("UPTRAIL_HTTP_TIMEOUT_SECS", &mut cfg.http_timeout_secs);
        parse_var("UPTRAIL_POLL_INTERVAL_MS", &mut cfg.poll_interval_ms);
        parse_var("UPTRAIL_RECONCILE_INTERVAL_SECS", &mut cfg.reconcile_interval_secs);
        parse_var("UPTRAIL_RESULT_RETENTION_DAYS", &mut cfg.result_retention_days);

        cfg.worker_concurrency = cfg.worker_concurrency.max(1);

        if let Ok(url) = env::var("UPTRAIL_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                cfg.webhook_url = Some(url);
            }
        }

        if let Ok(url) = env::var("UPTRAIL_SEED_URL") {
            if !url.trim().is_empty() {
                cfg.seed_url = Some(url);
            }
        }

        if let Ok(owner) = env::var("UPTRAIL_SEED_OWNER") {
            cfg.seed_owner = owner;
        }

        cfg
    }

    /// Timeouts handed to the probe pipeline.
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            dns_timeout: Duration::from_secs(self.dns_timeout_secs.max(1)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            http_timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

fn parse_var<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = env::var(name) {
        if let Ok(value) = raw.trim().parse() {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.db_path, "uptrail.db");
        assert_eq!(cfg.worker_concurrency, 2);
        assert_eq!(cfg.connect_timeout_secs, 5);
        assert_eq!(cfg.reconcile_interval(), Duration::from_secs(30));
        assert!(cfg.webhook_url.is_none());
    }

    #[test]
    fn test_probe_settings_use_configured_timeouts() {
        let cfg = ServerConfig {
            connect_timeout_secs: 3,
            http_timeout_secs: 0,
            ..Default::default()
        };
        let settings = cfg.probe_settings();
        assert_eq!(settings.connect_timeout, Duration::from_secs(3));
        // Zero would make every stage fail instantly.
        assert_eq!(settings.http_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_var_ignores_garbage() {
        let mut value = 7u64;
        std::env::set_var("UPTRAIL_TEST_PARSE_VAR", "not-a-number");
        parse_var("UPTRAIL_TEST_PARSE_VAR", &mut value);
        assert_eq!(value, 7);

        std::env::set_var("UPTRAIL_TEST_PARSE_VAR", " 42 ");
        parse_var("UPTRAIL_TEST_PARSE_VAR", &mut value);
        assert_eq!(value, 42);
    }
}
