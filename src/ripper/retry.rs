//! Bounded retry with exponential backoff for network-calling operations

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ripper::config_loader::Connection;
use crate::ripper::error::{RipperError, RipperResult};

/// Retry budget and backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&Connection::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(connection: &Connection) -> Self {
        Self {
            max_attempts: connection.max_attempts.max(1),
            base_delay_ms: connection.retry_base_delay_ms,
            max_delay_ms: connection.retry_max_delay_ms,
        }
    }

    /// Backoff after the given failed attempt (1-based)
    pub fn calculate_backoff(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(30);
        let delay = (1u64 << exponent).saturating_mul(self.base_delay_ms);
        delay.min(self.max_delay_ms)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// exhausts the attempt budget, or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        label: &str,
        mut operation: F,
    ) -> RipperResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RipperResult<T>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RipperError::Cancelled);
            }
            attempt += 1;
            if attempt > 1 {
                info!(attempt, max_attempts = self.max_attempts, "Retrying {}", label);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RipperError::Cancelled),
                result = operation() => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    let backoff = self.calculate_backoff(attempt);
                    warn!(attempt, error = %e, "{} failed, backing off for {}ms", label, backoff);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RipperError::Cancelled),
                        _ = sleep(Duration::from_millis(backoff)) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 250,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(5);
        assert_eq!(policy.calculate_backoff(1), 100);
        assert_eq!(policy.calculate_backoff(2), 200);
        assert_eq!(policy.calculate_backoff(3), 250);
        assert_eq!(policy.calculate_backoff(40), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = policy(3)
            .run(&CancellationToken::new(), "fetch", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RipperError::TransientNetwork("reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: RipperResult<()> = policy(3)
            .run(&CancellationToken::new(), "fetch", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RipperError::Http { status: 502, url: "u".into() })
                }
            })
            .await;

        assert!(matches!(result, Err(RipperError::Http { status: 502, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: RipperResult<()> = policy(3)
            .run(&CancellationToken::new(), "resolve", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RipperError::Extraction("missing node".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(RipperError::Extraction(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let slow = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: RipperResult<()> = slow
            .run(&cancel, "fetch", || async {
                Err(RipperError::TransientNetwork("timeout".into()))
            })
            .await;
        assert!(matches!(result, Err(RipperError::Cancelled)));
    }
}
