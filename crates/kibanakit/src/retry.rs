//! Retry logic with exponential backoff and jitter for transient errors.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;

/// Decides whether an error is worth another attempt.
pub type Classifier = fn(&Error) -> bool;

/// Backoff policy applied to every remote call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between two attempts (before jitter)
    pub max_delay: Duration,
    /// Maximum cumulative time spent waiting across all retries
    pub max_total_wait: Duration,
    /// Random extra delay, as a fraction of the computed delay (0.0 - 1.0)
    pub jitter: f64,
    /// Separates transient errors from terminal ones
    pub classifier: Classifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
            max_total_wait: Duration::from_secs(60),
            jitter: 0.2,
            classifier: Error::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with custom attempts and base delay.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retrying after `error`, with jitter and server hints applied.
    pub fn next_delay(&self, attempt: u32, error: &Error) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jittered = if self.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay.mul_f64(1.0 + extra)
        } else {
            delay
        };
        match error.retry_after() {
            Some(hint) => jittered.max(hint),
            None => jittered,
        }
    }

    /// Whether `error` should be retried under this policy.
    pub fn should_retry(&self, error: &Error) -> bool {
        (self.classifier)(error)
    }
}

/// Waits between attempts.
///
/// Injected so tests can run retry loops without real sleeping.
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`. Returns `false` if the wait was cut short by
    /// cancellation.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Sleeper that blocks the thread but wakes immediately on cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        !cancel.wait_timeout(duration)
    }
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called when an operation is being retried.
    ///
    /// # Arguments
    /// * `attempt` - Attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - The error that triggered the retry
    /// * `delay` - Time until next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration);
}

/// Callback that logs each retry at warn level.
pub struct LogCallback<'a> {
    /// What is being retried, e.g. `staging: create dashboard/a@default`
    pub operation: &'a str,
}

impl RetryCallback for LogCallback<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration) {
        log::warn!(
            "{}: attempt {}/{} failed: {}. Retrying in {:?}",
            self.operation,
            attempt,
            max_attempts,
            error,
            delay
        );
    }
}

/// Execute an operation with retry logic.
///
/// Retries the operation while it returns an error the policy classifies as
/// transient, waiting between attempts through `sleeper`. Stops early when
/// the next wait would exceed the policy's total wait budget, and returns
/// [`Error::Cancelled`] if cancellation interrupts a wait.
pub fn with_retry<T, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancelToken,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut waited = Duration::ZERO;
    let mut attempt = 0;

    loop {
        let error = match operation() {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        // If error is not retryable, return immediately
        if !policy.should_retry(&error) {
            return Err(error);
        }

        // If this was the last attempt, return the error
        if attempt + 1 >= max_attempts {
            return Err(error);
        }

        let delay = policy.next_delay(attempt, &error);
        if waited + delay > policy.max_total_wait {
            log::debug!(
                "retry budget of {:?} exhausted after {} attempts",
                policy.max_total_wait,
                attempt + 1
            );
            return Err(error);
        }

        if let Some(cb) = callback {
            cb.on_retry(attempt + 1, max_attempts, &error, delay);
        }

        if !sleeper.sleep(delay, cancel) {
            return Err(Error::Cancelled);
        }
        waited += delay;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Mutex;

    /// Records requested waits instead of sleeping.
    #[derive(Default)]
    struct FakeSleeper {
        waits: Mutex<Vec<Duration>>,
    }

    impl Sleeper for FakeSleeper {
        fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
            self.waits.lock().unwrap().push(duration);
            !cancel.is_cancelled()
        }
    }

    fn network_error() -> Error {
        Error::Network {
            url: "http://kibana".to_string(),
            message: "connection reset".to_string(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(1),
            max_total_wait: Duration::from_secs(60),
            jitter: 0.0,
            classifier: Error::is_retryable,
        }
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), 2.0);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        // capped at max_delay
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..fast_policy(3)
        };
        for _ in 0..50 {
            let delay = policy.next_delay(0, &network_error());
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_retry_after_raises_delay() {
        let policy = fast_policy(3);
        let err = Error::RateLimited {
            url: "http://kibana".to_string(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(policy.next_delay(0, &err), Duration::from_secs(3));
    }

    #[test]
    fn test_with_retry_success_first_try() {
        let sleeper = FakeSleeper::default();
        let result = with_retry(
            &RetryPolicy::no_retry(),
            &sleeper,
            &CancelToken::new(),
            None,
            || Ok::<_, Error>(42),
        );
        assert_eq!(result.unwrap(), 42);
        assert!(sleeper.waits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_with_retry_non_retryable_error() {
        let sleeper = FakeSleeper::default();
        let attempts = Cell::new(0);

        let result: Result<()> =
            with_retry(&fast_policy(5), &sleeper, &CancelToken::new(), None, || {
                attempts.set(attempts.get() + 1);
                Err(Error::Client {
                    status: 400,
                    url: "http://kibana".to_string(),
                    body: "bad request".to_string(),
                })
            });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_with_retry_eventual_success() {
        let sleeper = FakeSleeper::default();
        let attempts = Cell::new(0);

        let result = with_retry(&fast_policy(3), &sleeper, &CancelToken::new(), None, || {
            let current = attempts.get();
            attempts.set(current + 1);
            if current < 2 { Err(network_error()) } else { Ok(42) }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.get(), 3);
        assert_eq!(
            *sleeper.waits.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn test_with_retry_all_attempts_fail() {
        let sleeper = FakeSleeper::default();
        let attempts = Cell::new(0);

        let result: Result<()> =
            with_retry(&fast_policy(3), &sleeper, &CancelToken::new(), None, || {
                attempts.set(attempts.get() + 1);
                Err(network_error())
            });

        assert!(matches!(result, Err(Error::Network { .. })));
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_total_wait_budget_stops_retrying() {
        let sleeper = FakeSleeper::default();
        let attempts = Cell::new(0);
        let policy = RetryPolicy {
            max_total_wait: Duration::from_millis(250),
            ..fast_policy(10)
        };

        let result: Result<()> = with_retry(&policy, &sleeper, &CancelToken::new(), None, || {
            attempts.set(attempts.get() + 1);
            Err(network_error())
        });

        assert!(result.is_err());
        // waits of 100ms + 200ms would exceed 250ms, so only one retry happens
        assert_eq!(attempts.get(), 2);
        assert_eq!(*sleeper.waits.lock().unwrap(), vec![Duration::from_millis(100)]);
    }

    #[test]
    fn test_cancel_during_backoff() {
        let sleeper = FakeSleeper::default();
        let cancel = CancelToken::new();
        let attempts = Cell::new(0);

        let result: Result<()> = with_retry(&fast_policy(5), &sleeper, &cancel, None, || {
            attempts.set(attempts.get() + 1);
            cancel.cancel();
            Err(network_error())
        });

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_custom_classifier() {
        let sleeper = FakeSleeper::default();
        let attempts = Cell::new(0);
        let policy = RetryPolicy {
            classifier: |_| false,
            ..fast_policy(5)
        };

        let _: Result<()> = with_retry(&policy, &sleeper, &CancelToken::new(), None, || {
            attempts.set(attempts.get() + 1);
            Err(network_error())
        });

        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_callback_invoked() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingCallback(AtomicU32);
        impl RetryCallback for CountingCallback {
            fn on_retry(&self, _: u32, _: u32, _: &Error, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let callback = CountingCallback(AtomicU32::new(0));
        let _: Result<()> = with_retry(
            &fast_policy(3),
            &FakeSleeper::default(),
            &CancelToken::new(),
            Some(&callback),
            || Err(network_error()),
        );

        // Called for each retry (not the first attempt, not the last)
        assert_eq!(callback.0.load(Ordering::SeqCst), 2);
    }
}
