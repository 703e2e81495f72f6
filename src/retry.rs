//! Bounded retry for eventually consistent cloud operations
//!
//! Cloud APIs often report a freshly created resource as missing for a short
//! while. [`retry_until`] polls a condition with exponential backoff,
//! retrying only errors the [`RetryPolicy`] marks as retryable.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Decides whether an error is worth another attempt
pub type RetryPredicate = fn(&Error) -> bool;

/// Backoff schedule and retryable-error predicate
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Total time budget; `None` bounds the loop by attempts only
    pub max_elapsed: Option<Duration>,
    pub max_attempts: u32,
    pub retryable: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_elapsed: Some(Duration::from_secs(300)),
            max_attempts: 32,
            retryable: never,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("initial_interval", &self.initial_interval)
            .field("multiplier", &self.multiplier)
            .field("max_interval", &self.max_interval)
            .field("max_elapsed", &self.max_elapsed)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Same schedule with a different retryable-error predicate
    pub fn retrying(self, retryable: RetryPredicate) -> Self {
        Self { retryable, ..self }
    }

    /// Same schedule bounded by `max_elapsed`
    pub fn within(self, max_elapsed: Duration) -> Self {
        Self {
            max_elapsed: Some(max_elapsed),
            ..self
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_interval)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(self.max_elapsed)
            .build()
    }
}

/// Predicate that retries nothing
pub fn never(_: &Error) -> bool {
    false
}

/// Poll `condition` until it returns `Ok(true)`
///
/// `Ok(false)` and retryable errors schedule another attempt; any other
/// error is returned at once. When the schedule is exhausted the last
/// retryable error is returned, or [`Error::Timeout`] when there was none.
pub async fn retry_until<F, Fut>(policy: &RetryPolicy, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut backoff = policy.backoff();
    let mut last_retryable: Option<Error> = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match condition().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                trace!("Condition not met on attempt {}", attempt);
            }
            Err(e) if (policy.retryable)(&e) => {
                debug!("Retryable error on attempt {}: {}", attempt, e);
                last_retryable = Some(e);
            }
            Err(e) => return Err(e),
        }

        if attempt >= policy.max_attempts {
            break;
        }
        match backoff.next_backoff() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => break,
        }
    }

    Err(last_retryable.unwrap_or_else(|| {
        Error::Timeout(format!("condition not met after {} attempts", attempt))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            multiplier: 1.5,
            max_interval: Duration::from_millis(5),
            max_elapsed: None,
            max_attempts: 5,
            retryable: never,
        }
    }

    fn not_found(e: &Error) -> bool {
        e.is_not_found()
    }

    #[tokio::test]
    async fn test_succeeds_after_retryable_errors() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy().retrying(not_found);

        let calls_ref = &calls;
        retry_until(&policy, || async move {
            let n = calls_ref.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Error::NotFound("not yet".into()))
            } else {
                Ok(true)
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let err = retry_until(&fast_policy(), || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err::<bool, _>(Error::AccessDenied("nope".into()))
        })
        .await
        .unwrap_err();

        assert_matches!(err, Error::AccessDenied(_));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_retryable_error() {
        let policy = fast_policy().retrying(not_found);
        let err = retry_until(&policy, || async {
            Err::<bool, _>(Error::NotFound("still missing".into()))
        })
        .await
        .unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_exhaustion_without_error_times_out() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let err = retry_until(&fast_policy(), || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await
        .unwrap_err();

        assert_matches!(err, Error::Timeout(_));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(30));
        assert!(!(policy.retryable)(&Error::NotFound("x".into())));

        let bounded = policy.within(Duration::from_secs(10));
        assert_eq!(bounded.max_elapsed, Some(Duration::from_secs(10)));
    }
}
