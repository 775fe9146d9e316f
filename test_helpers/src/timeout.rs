//! Bound futures with timeouts in async tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::error::Elapsed;

/// Extension trait bounding a future with a wall-clock timeout.
///
/// Intended for tests: an await that should complete "immediately" can be
/// wrapped so a logic bug hangs the test for a bounded time instead of
/// forever.
#[async_trait]
pub trait FutureTimeout: std::future::Future + Send + Sized {
    /// Await `self` for at most `duration`.
    async fn with_timeout(self, duration: Duration) -> Result<Self::Output, Elapsed> {
        tokio::time::timeout(duration, self).await
    }

    /// Await `self` for at most `duration`, panicking if it does not
    /// complete in time.
    async fn with_timeout_panic(self, duration: Duration) -> Self::Output
    where
        Self::Output: Send,
    {
        tokio::time::timeout(duration, self)
            .await
            .expect("future did not complete within the timeout")
    }
}

impl<F> FutureTimeout for F where F: std::future::Future + Send + Sized {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_timeout() {
        let v = async { 42 }.with_timeout_panic(Duration::from_secs(1)).await;
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn elapses() {
        let res = std::future::pending::<()>()
            .with_timeout(Duration::from_millis(10))
            .await;
        assert!(res.is_err());
    }
}
