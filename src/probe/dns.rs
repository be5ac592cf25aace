//! DNS stage: resolve the monitor host through the system resolver.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::{ProbeError, StageFailure, StageOutcome};

/// Resolve `host` and return the first address with the resolution latency.
pub async fn resolve_host(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<(SocketAddr, u64), ProbeError> {
    let start = Instant::now();

    let mut addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("lookup failed for {}: {}", host, e)))?;

    let elapsed = start.elapsed().as_millis() as u64;

    let addr = addrs
        .next()
        .ok_or_else(|| ProbeError::Network(format!("no addresses for {}", host)))?;

    Ok((addr, elapsed))
}

/// Run the DNS stage. A failure means there is nothing to connect to.
pub async fn run_dns_stage(
    host: &str,
    port: u16,
    timeout: Duration,
) -> (StageOutcome, Option<SocketAddr>) {
    match resolve_host(host, port, timeout).await {
        Ok((addr, elapsed)) => (StageOutcome::Ok(elapsed), Some(addr)),
        Err(e) => {
            tracing::debug!("DNS stage failed for {}: {}", host, e);
            let reason = match e {
                ProbeError::Timeout(_) => StageFailure::Timeout,
                _ => StageFailure::Unresolvable,
            };
            (StageOutcome::Failed(reason), None)
        }
    }
}
