//! HTTP stage: GET the monitor URL and time the first response byte.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::{ProbeError, ProbeTarget, StageFailure, StageOutcome};

/// Result of the HTTP stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpStage {
    pub ttfb: StageOutcome,
    pub status_code: Option<u16>,
}

fn build_client(
    target: &ProbeTarget,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .no_proxy()
        // Pin the request to the address the DNS stage resolved.
        .resolve(&target.host, addr)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))
}

/// Issue a GET and return time-to-first-byte in milliseconds with the status code.
///
/// The response body is never read.
pub async fn fetch_first_byte(
    target: &ProbeTarget,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<(u64, u16), ProbeError> {
    let client = build_client(target, addr, timeout)?;

    let start = Instant::now();

    let response = client
        .get(target.url.clone())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

    let ttfb = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    drop(response);

    Ok((ttfb, status))
}

/// Run the HTTP stage.
pub async fn run_http_stage(
    target: &ProbeTarget,
    addr: SocketAddr,
    timeout: Duration,
) -> HttpStage {
    match fetch_first_byte(target, addr, timeout).await {
        Ok((ttfb, status)) => HttpStage {
            ttfb: StageOutcome::Ok(ttfb),
            status_code: Some(status),
        },
        Err(e) => {
            tracing::debug!("HTTP stage failed for {}: {}", target.url, e);
            let reason = match e {
                ProbeError::Timeout(_) => StageFailure::Timeout,
                _ => StageFailure::Protocol,
            };
            HttpStage {
                ttfb: StageOutcome::Failed(reason),
                status_code: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_captures_status_code() {
        let addr =
            serve_once("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n").await;
        let target = ProbeTarget::parse(&format!("http://localhost:{}/", addr.port())).unwrap();

        let stage = run_http_stage(&target, addr, Duration::from_secs(2)).await;
        assert!(stage.ttfb.is_ok());
        assert_eq!(stage.status_code, Some(503));
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let addr = serve_once(
            "HTTP/1.1 301 Moved Permanently\r\n\
             location: http://elsewhere.invalid/\r\n\
             content-length: 0\r\n\r\n",
        )
        .await;
        let target = ProbeTarget::parse(&format!("http://localhost:{}/", addr.port())).unwrap();

        let stage = run_http_stage(&target, addr, Duration::from_secs(2)).await;
        assert_eq!(stage.status_code, Some(301));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection without answering.
            if let Ok((socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(socket);
            }
        });

        let target = ProbeTarget::parse(&format!("http://localhost:{}/", addr.port())).unwrap();
        let stage = run_http_stage(&target, addr, Duration::from_millis(300)).await;
        assert_eq!(stage.ttfb, StageOutcome::Failed(StageFailure::Timeout));
        assert_eq!(stage.status_code, None);
    }
}
