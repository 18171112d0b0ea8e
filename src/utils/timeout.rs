//! Timeout constants and async timeout wrappers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default idle timeout for a connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default grace period for graceful shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a secure-transport handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `future`, failing with [`ProtocolError::Timeout`] once `duration` elapses.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_in_time() {
        let out = with_timeout_error(async { Ok(7) }, Duration::from_millis(100)).await;
        assert!(matches!(out, Ok(7)));
    }

    #[tokio::test]
    async fn test_times_out() {
        let out: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(out, Err(ProtocolError::Timeout)));
    }
}
