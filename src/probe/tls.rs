//! TLS stage: handshake with SNI over the already-open TCP connection.

use chrono::{DateTime, Utc};
use rustls::pki_types::ServerName;
use rustls::{CertificateError, ClientConfig, RootCertStore};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::{ProbeError, StageFailure, StageOutcome};

static CLIENT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Shared client configuration validating against the Mozilla root set.
fn client_config() -> Result<Arc<ClientConfig>, ProbeError> {
    if let Some(config) = CLIENT_CONFIG.get() {
        return Ok(config.clone());
    }

    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Network(format!("tls config: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(CLIENT_CONFIG.get_or_init(|| Arc::new(config)).clone())
}

/// Map a handshake error onto a stage failure.
///
/// rustls reports certificate problems as typed errors wrapped in the I/O
/// error, so expiry can be told apart from other validation failures without
/// looking at the message text.
pub fn classify_handshake_error(err: &std::io::Error) -> StageFailure {
    let tls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    match tls_error {
        Some(rustls::Error::InvalidCertificate(CertificateError::Expired))
        | Some(rustls::Error::InvalidCertificate(CertificateError::ExpiredContext { .. })) => {
            StageFailure::CertificateExpired
        }
        Some(rustls::Error::InvalidCertificate(_)) => StageFailure::CertificateInvalid,
        Some(_) => StageFailure::Handshake,
        None if err.kind() == std::io::ErrorKind::TimedOut => StageFailure::Timeout,
        None => StageFailure::Handshake,
    }
}

/// Perform a validating handshake with `host` as the server name.
pub async fn tls_handshake(
    stream: TcpStream,
    host: &str,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, StageFailure> {
    let config = client_config().map_err(|e| {
        tracing::error!("TLS client setup failed: {}", e);
        StageFailure::Handshake
    })?;

    let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
        tracing::debug!("Invalid TLS server name {}: {}", host, e);
        StageFailure::Handshake
    })?;

    let connector = TlsConnector::from(config);
    match tokio::time::timeout(timeout, connector.connect(server_name, stream)).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(e)) => {
            tracing::debug!("TLS handshake with {} failed: {}", host, e);
            Err(classify_handshake_error(&e))
        }
        Err(_) => Err(StageFailure::Timeout),
    }
}

/// Run the TLS stage, timing the handshake only.
pub async fn run_tls_stage(stream: TcpStream, host: &str, timeout: Duration) -> StageOutcome {
    let start = Instant::now();
    match tls_handshake(stream, host, timeout).await {
        Ok(_) => StageOutcome::Ok(start.elapsed().as_millis() as u64),
        Err(reason) => StageOutcome::Failed(reason),
    }
}

/// Read the `notAfter` of the leaf certificate the server presented.
pub fn peer_certificate_expiry(stream: &TlsStream<TcpStream>) -> Result<DateTime<Utc>, ProbeError> {
    let (_, session) = stream.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|chain| chain.first())
        .ok_or_else(|| ProbeError::Network("server presented no certificate".to_string()))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| ProbeError::Network(format!("unparseable certificate: {}", e)))?;

    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| ProbeError::Network("certificate expiry out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_expired_certificate_is_distinguished() {
        let err = Error::new(
            ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::Expired),
        );
        assert_eq!(classify_handshake_error(&err), StageFailure::CertificateExpired);
    }

    #[test]
    fn test_other_certificate_errors_are_invalid() {
        let err = Error::new(
            ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        assert_eq!(classify_handshake_error(&err), StageFailure::CertificateInvalid);
    }

    #[test]
    fn test_plain_io_errors_are_handshake_failures() {
        let reset = Error::new(ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(classify_handshake_error(&reset), StageFailure::Handshake);

        let timed_out = Error::new(ErrorKind::TimedOut, "slow");
        assert_eq!(classify_handshake_error(&timed_out), StageFailure::Timeout);
    }

    #[test]
    fn test_client_config_is_shared() {
        let a = client_config().unwrap();
        let b = client_config().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_handshake_against_plain_tcp_fails() {
        // A listener that accepts and immediately hangs up is not a TLS server.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let outcome = run_tls_stage(stream, "localhost", Duration::from_secs(2)).await;
        assert!(matches!(outcome, StageOutcome::Failed(_)));
    }
}
