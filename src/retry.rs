use crate::error::ReduceError;
use backon::{BlockingRetryable, ConstantBuilder};
use std::time::Duration;
use tracing::warn;

/// Fixed-backoff retry applied at the point of an infrastructure call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_tries: u32, delay: Duration) -> Self {
        Self { max_tries: max_tries.max(1), delay }
    }

    /// Constant delay between attempts. `max_tries` counts the first call, the builder counts retries.
    pub fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.max_tries.saturating_sub(1) as usize)
    }

    /// Run `op` until it succeeds or `max_tries` attempts have failed; the last error is returned.
    pub fn run<T, F>(&self, what: &str, op: F) -> Result<T, ReduceError>
    where
        F: FnMut() -> Result<T, ReduceError>,
    {
        let max = self.max_tries;
        let mut attempt = 0u32;
        op.retry(self.backoff())
            .sleep(std::thread::sleep)
            .notify(|e: &ReduceError, delay: Duration| {
                attempt += 1;
                warn!(attempt, max, error = %e, "{} failed, retrying in {:.1}s", what, delay.as_secs_f32());
            })
            .call()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(20, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let result = policy.run("op", || {
            calls += 1;
            if calls < 3 { Err(ReduceError::Other("flaky".into())) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_max_tries() {
        let policy = RetryPolicy::new(4, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), _> = policy.run("op", || {
            calls += 1;
            Err(ReduceError::Other("down".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_single_try_never_retries() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_tries, 1);
        let mut calls = 0;
        let result: Result<(), _> = policy.run("op", || {
            calls += 1;
            Err(ReduceError::Other("down".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_default_is_twenty_tries_one_second_apart() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_tries, 20);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }
}
