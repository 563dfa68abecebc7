//! The retry state machine shared by the sample and metadata send paths.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::StoreError;

/// One retriable unit of work against the write client. Implementations
/// own the prepared request and whatever per-attempt bookkeeping the path
/// needs (stale refiltering, counter bumps).
#[async_trait]
pub(crate) trait StoreAttempt: Send {
    async fn attempt(&mut self, try_index: usize) -> Result<(), StoreError>;

    /// Called once per retry, after the backoff wait.
    fn on_retry(&mut self);
}

/// Runs `attempt` until it succeeds, fails non-recoverably, or `shutdown`
/// fires. Recoverable errors back off exponentially between `min_backoff`
/// and `max_backoff`, unless the endpoint supplied an explicit delay, which
/// then also seeds the next backoff step.
pub(crate) async fn send_with_backoff<A: StoreAttempt + ?Sized>(
    shutdown: &CancellationToken,
    min_backoff: Duration,
    max_backoff: Duration,
    attempt: &mut A,
) -> Result<(), StoreError> {
    let mut backoff = min_backoff;
    let mut try_index = 0;

    loop {
        if shutdown.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let error = match attempt.attempt(try_index).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        let StoreError::Recoverable { retry_after, .. } = &error else {
            return Err(error);
        };

        let sleep = match retry_after {
            Some(delay) if *delay > Duration::ZERO => {
                info!(delay_ms = delay.as_millis() as u64, "retrying after delay specified by endpoint");
                *delay
            }
            _ => backoff,
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown.cancelled() => {}
        }

        attempt.on_retry();
        warn!(error = %error, "failed to send batch, retrying");

        backoff = (sleep * 2).min(max_backoff);
        try_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StoreError;

    struct ScriptedAttempt {
        outcomes: Vec<Result<(), StoreError>>,
        attempts: usize,
        retries: usize,
    }

    #[async_trait]
    impl StoreAttempt for ScriptedAttempt {
        async fn attempt(&mut self, _try_index: usize) -> Result<(), StoreError> {
            self.attempts += 1;
            self.outcomes.remove(0)
        }

        fn on_retry(&mut self) {
            self.retries += 1;
        }
    }

    fn recoverable(retry_after: Option<Duration>) -> StoreError {
        StoreError::Recoverable {
            message: "boom".into(),
            retry_after,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recoverable_errors_until_success() {
        let shutdown = CancellationToken::new();
        let mut attempt = ScriptedAttempt {
            outcomes: vec![Err(recoverable(None)), Err(recoverable(None)), Ok(())],
            attempts: 0,
            retries: 0,
        };
        let result = send_with_backoff(
            &shutdown,
            Duration::from_millis(30),
            Duration::from_secs(5),
            &mut attempt,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(attempt.attempts, 3);
        assert_eq!(attempt.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_recoverable_errors_stop_the_loop() {
        let shutdown = CancellationToken::new();
        let mut attempt = ScriptedAttempt {
            outcomes: vec![Err(StoreError::Rejected {
                message: "bad labels".into(),
            })],
            attempts: 0,
            retries: 0,
        };
        let result = send_with_backoff(
            &shutdown,
            Duration::from_millis(30),
            Duration::from_secs(5),
            &mut attempt,
        )
        .await;
        assert!(matches!(result, Err(StoreError::Rejected { .. })));
        assert_eq!(attempt.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_delay_overrides_backoff_and_seeds_the_next_step() {
        let shutdown = CancellationToken::new();
        let mut attempt = ScriptedAttempt {
            outcomes: vec![
                Err(recoverable(Some(Duration::from_secs(2)))),
                Err(recoverable(None)),
                Ok(()),
            ],
            attempts: 0,
            retries: 0,
        };
        let started = tokio::time::Instant::now();
        send_with_backoff(
            &shutdown,
            Duration::from_millis(30),
            Duration::from_secs(60),
            &mut attempt,
        )
        .await
        .expect("eventual success");
        // 2s from the endpoint, then the doubled 4s backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6));
        assert!(elapsed < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_the_wait() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut attempt = ScriptedAttempt {
            outcomes: vec![],
            attempts: 0,
            retries: 0,
        };
        let result = send_with_backoff(
            &shutdown,
            Duration::from_millis(30),
            Duration::from_secs(5),
            &mut attempt,
        )
        .await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(attempt.attempts, 0);
    }
}
