//! Diagnosis: map a probe report onto UP/SLOW/DOWN and a reason.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::CheckStatus;
use crate::probe::ProbeReport;

/// Time to first byte above which the backend is considered slow.
pub const SLOW_TTFB_MS: u64 = 1500;
/// TLS handshake time above which the edge is considered slow.
pub const SLOW_TLS_MS: u64 = 800;
/// DNS resolution time above which the resolver is considered slow.
pub const SLOW_DNS_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    DnsFailure,
    NetworkBlock,
    TlsFailure,
    ServerError,
    BackendLatency,
    TlsLatency,
    DnsLatency,
    Healthy,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::DnsFailure => "DNS_FAILURE",
            Reason::NetworkBlock => "NETWORK_BLOCK",
            Reason::TlsFailure => "TLS_FAILURE",
            Reason::ServerError => "SERVER_ERROR",
            Reason::BackendLatency => "BACKEND_LATENCY",
            Reason::TlsLatency => "TLS_LATENCY",
            Reason::DnsLatency => "DNS_LATENCY",
            Reason::Healthy => "HEALTHY",
        }
    }

    /// Human readable explanation for reports and alerts.
    pub fn message(&self) -> &'static str {
        match self {
            Reason::DnsFailure => {
                "Domain cannot be resolved. DNS records missing or nameserver down."
            }
            Reason::NetworkBlock => "Server unreachable. Port blocked, firewall, or host offline.",
            Reason::TlsFailure => {
                "HTTPS handshake failed. Certificate invalid or HTTPS misconfigured."
            }
            Reason::ServerError => "Server responded with 5xx.",
            Reason::BackendLatency => "Server is responding slowly.",
            Reason::TlsLatency => "TLS handshake slow.",
            Reason::DnsLatency => "DNS resolution slow.",
            Reason::Healthy => "All network layers operational.",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reason = match s {
            "DNS_FAILURE" => Reason::DnsFailure,
            "NETWORK_BLOCK" => Reason::NetworkBlock,
            "TLS_FAILURE" => Reason::TlsFailure,
            "SERVER_ERROR" => Reason::ServerError,
            "BACKEND_LATENCY" => Reason::BackendLatency,
            "TLS_LATENCY" => Reason::TlsLatency,
            "DNS_LATENCY" => Reason::DnsLatency,
            "HEALTHY" => Reason::Healthy,
            other => return Err(format!("unknown reason: {}", other)),
        };
        Ok(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Diagnosis {
    pub status: CheckStatus,
    pub reason: Reason,
}

impl Diagnosis {
    fn new(status: CheckStatus, reason: Reason) -> Self {
        Self { status, reason }
    }
}

/// Diagnose a probe report. Rules are checked in priority order and the
/// first match wins.
pub fn diagnose(report: &ProbeReport) -> Diagnosis {
    let Some(dns_ms) = report.dns.elapsed_ms() else {
        return Diagnosis::new(CheckStatus::Down, Reason::DnsFailure);
    };

    if !report.tcp.is_ok() {
        return Diagnosis::new(CheckStatus::Down, Reason::NetworkBlock);
    }

    let tls_ms = report.tls.elapsed_ms();
    if report.tls_required && tls_ms.is_none() {
        return Diagnosis::new(CheckStatus::Down, Reason::TlsFailure);
    }

    if report.status_code.is_some_and(|code| code >= 500) {
        return Diagnosis::new(CheckStatus::Down, Reason::ServerError);
    }

    if report.http.elapsed_ms().is_some_and(|ttfb| ttfb > SLOW_TTFB_MS) {
        return Diagnosis::new(CheckStatus::Slow, Reason::BackendLatency);
    }

    if tls_ms.is_some_and(|ms| ms > SLOW_TLS_MS) {
        return Diagnosis::new(CheckStatus::Slow, Reason::TlsLatency);
    }

    if dns_ms > SLOW_DNS_MS {
        return Diagnosis::new(CheckStatus::Slow, Reason::DnsLatency);
    }

    Diagnosis::new(CheckStatus::Up, Reason::Healthy)
}
