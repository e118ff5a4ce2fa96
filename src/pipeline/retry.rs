//! Retry with exponential backoff for transient failures, and cooperative
//! cancellation.

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Shared cancellation flag, checked at state boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    retries: u32,
}

impl Backoff {
    /// Schedule from worker settings.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_initial_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            retries: config.max_retries,
        }
    }

    /// Schedule with explicit values.
    pub const fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial,
            max,
            retries,
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at the maximum.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Retries allowed after the first attempt.
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Run `op`, retrying transient errors.
    ///
    /// Non-transient errors return at once. Cancellation is checked before
    /// each retry. After the last retry the last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, cancel: &CancelFlag, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{what} failed (attempt {}/{}): {e}; retrying in {delay:?}",
                        attempt + 1,
                        self.retries + 1
                    );
                    cancel.check()?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn transient() -> Error {
        Error::StoreUnavailable {
            reason: "flaky".to_string(),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350), 5);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(350));
        assert_eq!(backoff.delay(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 3);
        let calls = AtomicU32::new(0);
        let value = backoff
            .run("op", &CancelFlag::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(transient()) } else { Ok(n) } }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 2);
        let calls = AtomicU32::new(0);
        let result: Result<()> = backoff
            .run("op", &CancelFlag::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 5);
        let calls = AtomicU32::new(0);
        let result: Result<()> = backoff
            .run("op", &CancelFlag::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Internal {
                        message: "bug".to_string(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_retrying() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 5);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result: Result<()> = backoff
            .run("op", &cancel, || async { Err(transient()) })
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
