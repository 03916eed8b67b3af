use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// Errors that may succeed if the operation is simply repeated
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Retry configuration for store and queue operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff: 1.0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // broker reconnect: 20 attempts, 5s apart
        Self::fixed(20, Duration::from_secs(5))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },

    #[error("{operation} failed: {error}")]
    Permanent { operation: String, error: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }
}

/// Execute async operation, retrying transient failures with bounded attempts
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: &str,
    policy: &RetryPolicy,
    mut attempt_fn: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        match attempt_fn().await {
            Ok(result) => return Ok(result),
            Err(error) if !error.is_transient() => {
                return Err(RetryError::Permanent {
                    operation: operation.to_string(),
                    error,
                });
            }
            Err(last) if attempt >= policy.max_attempts => {
                error!(operation, attempt, error = %last, "retries exhausted");
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last,
                });
            }
            Err(error) => {
                warn!(operation, attempt, %error, "transient failure, retrying in {:?}", delay);
                sleep(delay).await;
                delay = delay.mul_f64(policy.backoff).min(policy.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    struct Flaky(bool);

    impl Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (transient: {})", self.0)
        }
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = Cell::new(0);
        let result = retry_with_backoff("connect", &quick(5), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(Flaky(true))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_with_backoff("connect", &quick(4), || {
            calls.set(calls.get() + 1);
            async { Err(Flaky(true)) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_with_backoff("decode", &quick(10), || {
            calls.set(calls.get() + 1);
            async { Err(Flaky(false)) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(calls.get(), 1);
    }
}
