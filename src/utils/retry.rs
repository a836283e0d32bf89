use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Retry policy with capped exponential backoff. Setting
/// `initial_delay == max_delay` yields a steady interval.
#[derive(Clone, Copy)]
pub struct RetryBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<usize>,
}

impl RetryBackoff {
    pub fn steady(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            max_attempts: None,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Runs `operation` until it succeeds, attempts are exhausted, or the
/// token is cancelled. `on_retry` observes each failure before the
/// backoff sleep.
pub async fn retry_with_backoff<T, F, Fut, L>(
    policy: RetryBackoff,
    shutdown: Option<&CancellationToken>,
    mut operation: F,
    mut on_retry: L,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    L: FnMut(usize, &anyhow::Error),
{
    let mut attempt = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        if let Some(token) = shutdown {
            if token.is_cancelled() {
                return Err(anyhow!("retry cancelled"));
            }
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(err);
                }
                on_retry(attempt, &err);

                match shutdown {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => return Err(anyhow!("retry cancelled")),
                            _ = sleep(delay) => {}
                        }
                    }
                    None => sleep(delay).await,
                }
                delay = (delay.saturating_mul(2)).min(policy.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff(
            RetryBackoff::steady(Duration::from_millis(1)),
            None,
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow!("not yet"))
                    } else {
                        Ok(n)
                    }
                }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn respects_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_with_backoff(
            RetryBackoff::steady(Duration::from_millis(1)).with_max_attempts(4),
            None,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("always fails")) }
            },
            |_, _| {},
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<()> = retry_with_backoff(
            RetryBackoff::steady(Duration::from_secs(60)),
            Some(&token),
            |_| async { Err(anyhow!("unreachable upstream")) },
            |_, _| {},
        )
        .await;

        assert!(result.is_err());
    }
}
