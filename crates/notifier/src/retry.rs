//! Retry escalation and bounded status-write retry.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use herald_common::error::AppError;
use herald_common::types::Channel;

/// Republishes a failed message to the channel's retry queue.
#[async_trait]
pub trait RetryPublisher: Send + Sync {
    /// Must only return `Ok` once the message is durably enqueued.
    async fn republish(
        &self,
        channel: Channel,
        body: &[u8],
        retry_count: u32,
        delay: Duration,
    ) -> Result<(), AppError>;
}

/// `base * 2^retry_count`, saturating at `Duration::MAX`.
pub fn backoff_delay(base: Duration, retry_count: u32) -> Duration {
    1u32.checked_shl(retry_count)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

/// Local retry policy for status writes after a delivery outcome.
#[derive(Debug, Clone, Copy)]
pub struct WriteRetry {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub factor: u32,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
            factor: 2,
        }
    }
}

impl WriteRetry {
    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. The last error is returned.
    pub async fn run<F, Fut>(&self, mut op: F) -> Result<(), AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), AppError>>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Status write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(self.factor);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_from_base() {
        let base = Duration::from_secs(1);
        let delays: Vec<u64> = (0..5).map(|n| backoff_delay(base, n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_backoff_is_monotonic_and_saturates() {
        let base = Duration::from_millis(250);
        let mut previous = Duration::ZERO;
        for n in 0..64 {
            let delay = backoff_delay(base, n);
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(backoff_delay(base, 40), Duration::MAX);
    }

    fn immediate(attempts: u32) -> WriteRetry {
        WriteRetry {
            attempts,
            initial_delay: Duration::ZERO,
            factor: 2,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = immediate(3)
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::Delivery("timeout".to_string()))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result = immediate(3)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Publish("down".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result = immediate(3)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::NotFound("gone".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
