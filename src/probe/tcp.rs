//! TCP stage: plain connect to the resolved address.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::{StageFailure, StageOutcome};

/// Connect to `addr` within `timeout`.
///
/// The open stream is handed back so the TLS stage can handshake on the
/// same connection it just timed.
pub async fn run_tcp_stage(
    addr: SocketAddr,
    timeout: Duration,
) -> (StageOutcome, Option<TcpStream>) {
    let start = Instant::now();

    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => (StageOutcome::Ok(start.elapsed().as_millis() as u64), Some(stream)),
        Ok(Err(e)) => {
            tracing::debug!("TCP stage failed for {}: {}", addr, e);
            let reason = match e.kind() {
                ErrorKind::TimedOut => StageFailure::Timeout,
                _ => StageFailure::Refused,
            };
            (StageOutcome::Failed(reason), None)
        }
        Err(_) => {
            tracing::debug!("TCP stage timed out for {} after {:?}", addr, timeout);
            (StageOutcome::Failed(StageFailure::Timeout), None)
        }
    }
}
