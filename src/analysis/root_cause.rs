//! Root cause: a finer failure tag attached to probe results and incidents.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::probe::{ProbeReport, StageFailure};

/// Time to first byte above which a response is tagged as slow.
pub const SLOW_RESPONSE_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RootCause {
    DnsFailure,
    TcpConnectionFailed,
    TlsHandshakeFailed,
    TlsCertExpired,
    #[serde(rename = "HTTP_5XX")]
    Http5xx,
    #[serde(rename = "HTTP_4XX")]
    Http4xx,
    Timeout,
    SlowResponse,
    Unknown,
}

impl RootCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootCause::DnsFailure => "DNS_FAILURE",
            RootCause::TcpConnectionFailed => "TCP_CONNECTION_FAILED",
            RootCause::TlsHandshakeFailed => "TLS_HANDSHAKE_FAILED",
            RootCause::TlsCertExpired => "TLS_CERT_EXPIRED",
            RootCause::Http5xx => "HTTP_5XX",
            RootCause::Http4xx => "HTTP_4XX",
            RootCause::Timeout => "TIMEOUT",
            RootCause::SlowResponse => "SLOW_RESPONSE",
            RootCause::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RootCause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cause = match s {
            "DNS_FAILURE" => RootCause::DnsFailure,
            "TCP_CONNECTION_FAILED" => RootCause::TcpConnectionFailed,
            "TLS_HANDSHAKE_FAILED" => RootCause::TlsHandshakeFailed,
            "TLS_CERT_EXPIRED" => RootCause::TlsCertExpired,
            "HTTP_5XX" => RootCause::Http5xx,
            "HTTP_4XX" => RootCause::Http4xx,
            "TIMEOUT" => RootCause::Timeout,
            "SLOW_RESPONSE" => RootCause::SlowResponse,
            "UNKNOWN" => RootCause::Unknown,
            other => return Err(format!("unknown root cause: {}", other)),
        };
        Ok(cause)
    }
}

/// Classify the cause of a check, following the same layer precedence as
/// the pipeline. A healthy check yields [`RootCause::Unknown`].
pub fn classify_root_cause(report: &ProbeReport) -> RootCause {
    if !report.dns.is_ok() {
        return RootCause::DnsFailure;
    }

    if !report.tcp.is_ok() {
        return RootCause::TcpConnectionFailed;
    }

    if report.tls_required && !report.tls.is_ok() {
        return match report.tls.failure() {
            Some(StageFailure::CertificateExpired) => RootCause::TlsCertExpired,
            _ => RootCause::TlsHandshakeFailed,
        };
    }

    match report.status_code {
        Some(code) if code >= 500 => return RootCause::Http5xx,
        Some(code) if code >= 400 => return RootCause::Http4xx,
        _ => {}
    }

    match report.http.elapsed_ms() {
        None => RootCause::Timeout,
        Some(ttfb) if ttfb > SLOW_RESPONSE_MS => RootCause::SlowResponse,
        Some(_) => RootCause::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StageOutcome;

    fn reached_http(status_code: Option<u16>, http: StageOutcome) -> ProbeReport {
        ProbeReport {
            tls_required: true,
            dns: StageOutcome::Ok(5),
            tcp: StageOutcome::Ok(5),
            tls: StageOutcome::Ok(5),
            http,
            status_code,
        }
    }

    #[test]
    fn test_layer_precedence() {
        let dns_down = ProbeReport {
            dns: StageOutcome::Failed(StageFailure::Unresolvable),
            ..ProbeReport::skipped(true)
        };
        assert_eq!(classify_root_cause(&dns_down), RootCause::DnsFailure);

        let tcp_down = ProbeReport {
            dns: StageOutcome::Ok(5),
            tcp: StageOutcome::Failed(StageFailure::Timeout),
            ..ProbeReport::skipped(true)
        };
        assert_eq!(classify_root_cause(&tcp_down), RootCause::TcpConnectionFailed);
    }

    #[test]
    fn test_expired_certificate() {
        let mut report = reached_http(None, StageOutcome::Skipped);
        report.tls = StageOutcome::Failed(StageFailure::CertificateExpired);
        assert_eq!(classify_root_cause(&report), RootCause::TlsCertExpired);

        report.tls = StageOutcome::Failed(StageFailure::CertificateInvalid);
        assert_eq!(classify_root_cause(&report), RootCause::TlsHandshakeFailed);
    }

    #[test]
    fn test_plain_http_never_blames_tls() {
        let report = ProbeReport {
            tls_required: false,
            tls: StageOutcome::Skipped,
            ..reached_http(Some(200), StageOutcome::Ok(50))
        };
        assert_eq!(classify_root_cause(&report), RootCause::Unknown);
    }

    #[test]
    fn test_http_status_classes() {
        assert_eq!(
            classify_root_cause(&reached_http(Some(503), StageOutcome::Ok(10))),
            RootCause::Http5xx
        );
        assert_eq!(
            classify_root_cause(&reached_http(Some(404), StageOutcome::Ok(10))),
            RootCause::Http4xx
        );
    }

    #[test]
    fn test_timeout_and_slow() {
        assert_eq!(
            classify_root_cause(&reached_http(None, StageOutcome::Failed(StageFailure::Timeout))),
            RootCause::Timeout
        );
        assert_eq!(
            classify_root_cause(&reached_http(Some(200), StageOutcome::Ok(2500))),
            RootCause::SlowResponse
        );
    }

    #[test]
    fn test_serde_names_match_tags() {
        let json = serde_json::to_string(&RootCause::Http5xx).unwrap();
        assert_eq!(json, "\"HTTP_5XX\"");
        let json = serde_json::to_string(&RootCause::TlsCertExpired).unwrap();
        assert_eq!(json, "\"TLS_CERT_EXPIRED\"");
    }
}
