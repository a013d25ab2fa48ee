//! Default durations and a timeout wrapper for async operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{ProxyError, Result};

/// Idle time after which the next client datagram starts a fresh session.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay between bind attempts and after a receive failure.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on a single credential resolution.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between periodic metrics log lines.
pub const METRICS_INTERVAL: Duration = Duration::from_secs(300);

/// Run `fut` with a deadline, mapping expiry to [`ProxyError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, dur: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(dur, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout),
    }
}
