//! Retry with linear backoff for higher-level operations
//!
//! Raw `run_cmd`/`add_file` calls are never retried implicitly since commands
//! are not assumed idempotent; callers opt in per operation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Upper bound on any single wait between attempts, in seconds
pub const MAX_RETRY_WAIT_SECS: u64 = 120;

/// How many times to try an operation and how long to wait in between
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, at least 1
    pub tries: u32,
    /// Wait grows by this many seconds per failed attempt
    pub wait_time_increase_secs: u64,
    /// Cap on a single wait, in seconds
    pub max_wait_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: 4,
            wait_time_increase_secs: 10,
            max_wait_secs: MAX_RETRY_WAIT_SECS,
        }
    }
}

impl RetryPolicy {
    /// Policy with `tries` attempts (clamped to at least 1) and default backoff
    #[must_use]
    pub fn new(tries: u32) -> Self {
        Self {
            tries: tries.max(1),
            ..Self::default()
        }
    }

    /// Set the per-attempt wait increase
    #[must_use]
    pub fn with_wait_time_increase(mut self, secs: u64) -> Self {
        self.wait_time_increase_secs = secs;
        self
    }

    /// Set the wait cap
    #[must_use]
    pub fn with_max_wait(mut self, secs: u64) -> Self {
        self.max_wait_secs = secs;
        self
    }

    /// Wait after the failed attempt with 0-based index `attempt`, given the
    /// wait that preceded it.
    ///
    /// RUN -> WAIT 0 -> RUN -> WAIT step -> RUN -> WAIT 2*step -> RUN
    ///
    /// The wait keeps growing until a previous wait reached the cap, after
    /// which it stays at the cap. A step that does not divide the cap can
    /// overshoot it once: with step 50 the waits are 0, 50, 100, 150, 120.
    #[must_use]
    pub fn next_wait(&self, attempt: u32, previous: Duration) -> Duration {
        let cap = Duration::from_secs(self.max_wait_secs);
        if previous < cap {
            Duration::from_secs(u64::from(attempt).saturating_mul(self.wait_time_increase_secs))
        } else {
            cap
        }
    }

    /// Every wait a run that never succeeds goes through, in order
    pub fn waits(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut previous = Duration::ZERO;
        (0..self.tries.max(1) - 1).map(move |attempt| {
            previous = self.next_wait(attempt, previous);
            previous
        })
    }

    /// Bind `f` to this policy, the decorator form of [`run_with_retries`]
    pub fn wrap<F>(&self, message: impl Into<String>, f: F) -> Retrying<F> {
        Retrying {
            f,
            message: message.into(),
            policy: self.clone(),
        }
    }
}

/// Run `operation` until it succeeds or `policy.tries` attempts are used up.
///
/// `message` names the action in log lines, e.g. "Tag images".
///
/// # Errors
/// Returns the error of the final attempt unchanged
pub async fn run_with_retries<F, Fut, T, E>(
    mut operation: F,
    message: &str,
    policy: &RetryPolicy,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let tries = policy.tries.max(1);
    let mut attempt = 0;
    let mut wait = Duration::ZERO;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt != 0 {
                    info!("{message} succeeded [try: {}/{tries}]", attempt + 1);
                }
                return Ok(value);
            }
            Err(e) if attempt + 1 < tries => {
                wait = policy.next_wait(attempt, wait);
                warn!(
                    "{message} failed. Will retry in {} seconds [try {}/{tries}]: {e}",
                    wait.as_secs(),
                    attempt + 1
                );
                sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                error!("{message} repeatedly fails");
                return Err(e);
            }
        }
    }
}

/// An operation bound to a retry policy
#[derive(Debug, Clone)]
pub struct Retrying<F> {
    f: F,
    message: String,
    policy: RetryPolicy,
}

impl<F> Retrying<F> {
    /// Invoke the wrapped operation with `arg`, retrying per the bound policy.
    ///
    /// `arg` is cloned for each attempt.
    ///
    /// # Errors
    /// Returns the error of the final attempt unchanged
    pub async fn call<A, Fut, T, E>(&self, arg: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        A: Clone,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        run_with_retries(|| (self.f)(arg.clone()), &self.message, &self.policy).await
    }

    /// Policy this operation is bound to
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn no_wait(tries: u32) -> RetryPolicy {
        RetryPolicy::new(tries).with_wait_time_increase(0)
    }

    #[tokio::test]
    async fn test_recovers_after_failures() {
        let calls = AtomicU32::new(0);

        let result = run_with_retries(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("Flaky function") } else { Ok("Success") } }
            },
            "flaky func test",
            &no_wait(3),
        )
        .await;

        assert_eq!(result, Ok("Success"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_tries() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = run_with_retries(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("failure {n}")) }
            },
            "broken func test",
            &no_wait(3),
        )
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_try_never_sleeps() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), &str> = run_with_retries(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope") }
            },
            "single",
            &RetryPolicy::new(1),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_progression() {
        let start = Instant::now();

        let result: Result<(), &str> =
            run_with_retries(|| async { Err("nope") }, "always fails", &RetryPolicy::default())
                .await;

        assert!(result.is_err());
        // 0 + 10 + 20 seconds across the three waits of four tries
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
    }

    #[test]
    fn test_wait_is_capped() {
        let policy = RetryPolicy::new(10).with_wait_time_increase(30);

        let waits: Vec<u64> = policy.waits().map(|w| w.as_secs()).collect();

        assert_eq!(waits, vec![0, 30, 60, 90, 120, 120, 120, 120, 120]);
    }

    #[test]
    fn test_wait_overshoots_cap_once_when_step_does_not_divide_it() {
        let policy = RetryPolicy::new(6).with_wait_time_increase(50);

        let waits: Vec<u64> = policy.waits().map(|w| w.as_secs()).collect();

        assert_eq!(waits, vec![0, 50, 100, 150, 120]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_sleeps_through_capped_progression() {
        let start = Instant::now();

        let result: Result<(), &str> = run_with_retries(
            || async { Err("nope") },
            "always fails",
            &RetryPolicy::new(6).with_wait_time_increase(50),
        )
        .await;

        assert!(result.is_err());
        // 0 + 50 + 100 + 150 + 120
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(420));
        assert!(elapsed < Duration::from_secs(421));
    }

    #[test]
    fn test_tries_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0).tries, 1);
    }

    #[tokio::test]
    async fn test_wrapped_operation_binds_arguments() {
        let calls = AtomicU32::new(0);
        let policy = no_wait(4);

        let counter = &calls;
        let double = policy.wrap("double", move |x: u32| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { if n == 0 { Err("first call fails") } else { Ok(x * 2) } }
        });

        assert_eq!(double.call(21).await, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(double.policy().tries, 4);
    }
}
