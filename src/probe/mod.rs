//! Layered probe pipeline.
//!
//! Runs DNS -> TCP -> TLS -> HTTP in a fail-fast cascade so that a failure
//! can be attributed to the layer it happened in. Network failures never
//! escape this module as errors: every stage resolves to a [`StageOutcome`].

mod dns;
mod http;
mod tcp;
mod tls;

pub use dns::*;
pub use http::*;
pub use tcp::*;
pub use tls::*;

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid target: {0}")]
    Target(String),
}

/// Why a stage failed.
///
/// Carries only what the classifiers need: which layer broke and whether the
/// certificate was the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFailure {
    Unresolvable,
    Timeout,
    Refused,
    CertificateExpired,
    CertificateInvalid,
    Handshake,
    Protocol,
}

impl StageFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageFailure::Unresolvable => "unresolvable",
            StageFailure::Timeout => "timeout",
            StageFailure::Refused => "refused",
            StageFailure::CertificateExpired => "certificate_expired",
            StageFailure::CertificateInvalid => "certificate_invalid",
            StageFailure::Handshake => "handshake",
            StageFailure::Protocol => "protocol",
        }
    }
}

/// Outcome of a single pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Stage succeeded after the given number of milliseconds.
    Ok(u64),
    Failed(StageFailure),
    /// Stage was not attempted, either because it does not apply to the
    /// scheme or because an earlier stage failed.
    Skipped,
}

impl StageOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, StageOutcome::Ok(_))
    }

    pub fn elapsed_ms(&self) -> Option<u64> {
        match self {
            StageOutcome::Ok(ms) => Some(*ms),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<StageFailure> {
        match self {
            StageOutcome::Failed(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Composed result of one pass through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// Whether the scheme requires a TLS handshake.
    pub tls_required: bool,
    pub dns: StageOutcome,
    pub tcp: StageOutcome,
    pub tls: StageOutcome,
    /// Time to first byte of the HTTP response.
    pub http: StageOutcome,
    pub status_code: Option<u16>,
}

impl ProbeReport {
    /// A report where nothing has run yet.
    pub fn skipped(tls_required: bool) -> Self {
        Self {
            tls_required,
            dns: StageOutcome::Skipped,
            tcp: StageOutcome::Skipped,
            tls: StageOutcome::Skipped,
            http: StageOutcome::Skipped,
            status_code: None,
        }
    }
}

/// Timeouts applied to each stage.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub dns_timeout: Duration,
    pub connect_timeout: Duration,
    pub http_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            dns_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Scheme, host and port derived from a monitor URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub url: Url,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ProbeTarget {
    pub fn parse(raw: &str) -> Result<Self, ProbeError> {
        let url = Url::parse(raw).map_err(|e| ProbeError::Target(e.to_string()))?;
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(ProbeError::Target(format!("unsupported scheme: {}", other))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| ProbeError::Target("missing host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });

        Ok(Self { url, host, port, tls })
    }
}

/// Run the full DNS -> TCP -> TLS -> HTTP cascade against `raw_url`.
///
/// Each stage only runs if the stages it depends on succeeded.
pub async fn run_full_probe(raw_url: &str, settings: &ProbeSettings) -> ProbeReport {
    let target = match ProbeTarget::parse(raw_url) {
        Ok(t) => t,
        Err(e) => {
            // URLs are validated before they reach the pipeline; treat a bad
            // one the same as a name that does not resolve.
            tracing::warn!("Probe target {} rejected: {}", raw_url, e);
            let mut report = ProbeReport::skipped(raw_url.starts_with("https"));
            report.dns = StageOutcome::Failed(StageFailure::Unresolvable);
            return report;
        }
    };

    let mut report = ProbeReport::skipped(target.tls);

    let (dns, addr) = run_dns_stage(&target.host, target.port, settings.dns_timeout).await;
    report.dns = dns;
    let Some(addr) = addr else {
        return report;
    };

    let (tcp, stream) = run_tcp_stage(addr, settings.connect_timeout).await;
    report.tcp = tcp;
    let Some(stream) = stream else {
        return report;
    };

    if target.tls {
        report.tls = run_tls_stage(stream, &target.host, settings.connect_timeout).await;
        if !report.tls.is_ok() {
            return report;
        }
    } else {
        drop(stream);
    }

    let http = run_http_stage(&target, addr, settings.http_timeout).await;
    report.http = http.ttfb;
    report.status_code = http.status_code;

    report
}
