//! Retry policies and the exponential-backoff executor.
//!
//! A [`RetryPolicy`] is an immutable description of how hard to try; the
//! executor [`execute_with_retry`] drives an async operation under one policy
//! and reports what happened as a [`RetryResult`].
//!
//! Retries are scoped to a single operation. The orchestrator wraps individual
//! RPC and signing calls, never the whole sign-in flow.

use std::borrow::Cow;
use std::fmt::{self, Display};
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::categorize::{ErrorCategory, categorize_error, should_retry};
use crate::proto::SignatureType;

/// Keywords that always justify another attempt.
const TRANSIENT_KEYWORDS: &[&str] = &[
    "network",
    "timeout",
    "connection",
    "temporarily unavailable",
    "service unavailable",
];

/// Keywords that must never be retried. A rejected wallet prompt is the user
/// saying no; prompting again would be hostile.
const TERMINAL_KEYWORDS: &[&str] = &[
    "user rejected",
    "user denied",
    "invalid-token",
    "expired-token",
    "invalid-credential",
    "user-disabled",
    "permission-denied",
];

/// Parameters controlling how an operation is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Name reported back in [`RetryResult::policy_used`].
    pub name: String,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Growth factor applied to the delay for each further retry. At least `1.0`.
    pub backoff_multiplier: f64,
    /// Case-insensitive substrings that make an error retryable.
    pub retryable_errors: Vec<String>,
    /// Case-insensitive substrings that make an error terminal.
    pub fatal_errors: Vec<String>,
}

fn keywords(list: &[&str]) -> Vec<String> {
    list.iter().map(|k| (*k).to_owned()).collect()
}

impl RetryPolicy {
    fn named(name: &str, max_retries: u32, delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            name: name.to_owned(),
            max_retries,
            retry_delay: Duration::from_millis(delay_ms),
            backoff_multiplier,
            retryable_errors: keywords(TRANSIENT_KEYWORDS),
            fatal_errors: keywords(TERMINAL_KEYWORDS),
        }
    }

    /// Default policy: 3 retries, 1s initial delay, doubling.
    #[must_use]
    pub fn standard() -> Self {
        Self::named("standard", 3, 1_000, 2.0)
    }

    /// Safe multisig wallets: fewer, slower retries since each prompt may
    /// involve several co-signers.
    #[must_use]
    pub fn safe_wallet() -> Self {
        Self::named("safe-wallet", 2, 2_000, 1.5)
    }

    /// First attempt of a session: fail fast so the user gets feedback quickly.
    #[must_use]
    pub fn fail_fast() -> Self {
        Self::named("first-attempt", 1, 500, 1.0)
    }

    /// Connectivity failures: more retries with a short initial delay.
    #[must_use]
    pub fn network() -> Self {
        Self::named("network", 4, 500, 2.0)
    }

    /// Throttled requests: the standard policy with a long start delay.
    /// Throttling is retried here even though it is not transient in general.
    #[must_use]
    pub fn rate_limited() -> Self {
        let mut policy = Self {
            name: "rate-limit".to_owned(),
            retry_delay: Duration::from_millis(5_000),
            ..Self::standard()
        };
        policy.retryable_errors.push("rate limit".to_owned());
        policy
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub const fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.retry_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Picks a policy for a signing operation.
///
/// Safe wallets always use [`RetryPolicy::safe_wallet`]; other wallets fail
/// fast on their first attempt and use the standard policy afterwards.
#[must_use]
pub fn policy_for_wallet(signature_type: SignatureType, is_first_attempt: bool) -> RetryPolicy {
    match signature_type {
        SignatureType::SafeWallet => RetryPolicy::safe_wallet(),
        _ if is_first_attempt => RetryPolicy::fail_fast(),
        _ => RetryPolicy::standard(),
    }
}

/// Picks a policy based on an error already observed.
#[must_use]
pub fn policy_for_error(message: &str) -> RetryPolicy {
    match categorize_error(message) {
        ErrorCategory::RateLimit => RetryPolicy::rate_limited(),
        ErrorCategory::Network => RetryPolicy::network(),
        _ => RetryPolicy::standard(),
    }
}

/// Progress report passed to the `on_retry` callback before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryAttempt<'a> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    /// Total attempts the policy allows.
    pub total_attempts: u32,
    /// Message of the failure being retried.
    pub last_error: &'a str,
    /// Time since the first attempt started.
    pub elapsed: Duration,
    /// Sleep before the next attempt.
    pub next_delay: Duration,
}

/// Optional hooks for [`execute_with_retry`].
#[derive(Default, Clone)]
pub struct RetryOptions<'a> {
    /// Invoked before each backoff sleep.
    pub on_retry: Option<&'a (dyn Fn(&RetryAttempt<'_>) + Send + Sync)>,
    /// Checked before every attempt; once cancelled no further attempt starts.
    pub cancel: Option<CancellationToken>,
}

impl fmt::Debug for RetryOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("on_retry", &self.on_retry.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Returned when the cancellation token fired before an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Operation aborted")]
pub struct OperationAborted;

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// Value of the successful attempt, or the error of the last one.
    pub outcome: Result<T, E>,
    /// Attempts actually started, at least one.
    pub attempts_made: u32,
    /// Time from the first attempt to resolution.
    pub total_time: Duration,
    /// Name of the policy that governed the run.
    pub policy_used: String,
}

impl<T, E> RetryResult<T, E> {
    /// Whether the final attempt succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Discards the bookkeeping and returns the outcome.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt if none succeeded.
    pub fn into_result(self) -> Result<T, E> {
        self.outcome
    }
}

/// Runs `operation` under `policy`, sleeping with exponential backoff between
/// failed attempts.
///
/// A failure stops the run early when [`should_retry`] rejects it, which is
/// how fatal errors skip the remaining attempts.
///
/// # Errors
///
/// Returns [`OperationAborted`] if the cancellation token is observed as
/// cancelled at the start of an attempt. Operation failures are reported in
/// [`RetryResult::outcome`], not as an `Err` of this function.
pub async fn execute_with_retry<T, E, F, Fut>(
    operation: F,
    policy: &RetryPolicy,
    options: RetryOptions<'_>,
) -> Result<RetryResult<T, E>, OperationAborted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_loop(operation, Cow::Borrowed(policy), false, options).await
}

/// Like [`execute_with_retry`], but once the first attempt fails the rest of
/// the run follows [`policy_for_error`] for that failure. A throttled request
/// then waits out the rate limit and a network failure gets more attempts.
///
/// # Errors
///
/// Returns [`OperationAborted`] under the same conditions as
/// [`execute_with_retry`].
pub async fn execute_with_error_policy<T, E, F, Fut>(
    operation: F,
    initial: &RetryPolicy,
    options: RetryOptions<'_>,
) -> Result<RetryResult<T, E>, OperationAborted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_loop(operation, Cow::Borrowed(initial), true, options).await
}

async fn retry_loop<T, E, F, Fut>(
    mut operation: F,
    mut policy: Cow<'_, RetryPolicy>,
    adapt_to_error: bool,
    options: RetryOptions<'_>,
) -> Result<RetryResult<T, E>, OperationAborted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if options
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            tracing::debug!(policy = %policy.name, attempt, "Retry loop aborted");
            return Err(OperationAborted);
        }

        let error = match operation().await {
            Ok(value) => {
                return Ok(RetryResult {
                    outcome: Ok(value),
                    attempts_made: attempt,
                    total_time: started.elapsed(),
                    policy_used: policy.name.clone(),
                });
            }
            Err(error) => error,
        };

        let message = error.to_string();
        if adapt_to_error && attempt == 1 {
            let chosen = policy_for_error(&message);
            if chosen.name != policy.name {
                tracing::debug!(from = %policy.name, to = %chosen.name, "Switching retry policy");
            }
            policy = Cow::Owned(chosen);
        }
        let total_attempts = policy.total_attempts();
        let exhausted = attempt >= total_attempts;
        if exhausted || !should_retry(&message, &policy) {
            tracing::debug!(
                policy = %policy.name,
                attempt,
                exhausted,
                error = %message,
                "Giving up on operation"
            );
            return Ok(RetryResult {
                outcome: Err(error),
                attempts_made: attempt,
                total_time: started.elapsed(),
                policy_used: policy.name.clone(),
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        if let Some(on_retry) = options.on_retry {
            on_retry(&RetryAttempt {
                attempt,
                total_attempts,
                last_error: &message,
                elapsed: started.elapsed(),
                next_delay: delay,
            });
        }
        tracing::debug!(
            policy = %policy.name,
            attempt,
            total_attempts,
            delay_ms = delay.as_millis(),
            error = %message,
            "Retrying after failure"
        );

        match &options.cancel {
            Some(token) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = token.cancelled() => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_wallet_policies() {
        let safe = policy_for_wallet(SignatureType::SafeWallet, true);
        assert_eq!(safe.name, "safe-wallet");
        assert_eq!(safe.max_retries, 2);
        assert_eq!(safe.retry_delay, Duration::from_millis(2_000));

        let first = policy_for_wallet(SignatureType::PersonalSign, true);
        assert_eq!(first.max_retries, 1);
        assert_eq!(first.retry_delay, Duration::from_millis(500));

        let later = policy_for_wallet(SignatureType::TypedData, false);
        assert_eq!(later, RetryPolicy::standard());
    }

    #[test]
    fn test_error_policies() {
        let network = policy_for_error("network unreachable");
        assert_eq!(network.max_retries, 4);
        assert_eq!(network.retry_delay, Duration::from_millis(500));

        let throttled = policy_for_error("Rate limit hit");
        assert_eq!(throttled.retry_delay, Duration::from_millis(5_000));
        assert_eq!(throttled.max_retries, RetryPolicy::standard().max_retries);

        assert_eq!(policy_for_error("weird").name, "standard");
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::standard();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4_000));

        let safe = RetryPolicy::safe_wallet();
        assert_eq!(safe.delay_for_attempt(2), Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::standard()
        };
        let result = execute_with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("network connection failed".to_owned())
                    } else {
                        Ok("done")
                    }
                }
            },
            &policy,
            RetryOptions::default(),
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(result.attempts_made, 3);
        assert_eq!(result.policy_used, "standard");
        assert_eq!(result.total_time, Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("auth/invalid-credential") }
            },
            &RetryPolicy::standard(),
            RetryOptions::default(),
        )
        .await
        .unwrap();

        assert!(!result.is_success());
        assert_eq!(result.attempts_made, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let result = execute_with_retry(
            || async { Err::<(), _>("timeout") },
            &RetryPolicy::fail_fast(),
            RetryOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(result.attempts_made, 2);
        assert_eq!(result.into_result(), Err("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_retry_reports_each_backoff() {
        let seen = Mutex::new(Vec::new());
        let on_retry = |attempt: &RetryAttempt<'_>| {
            seen.lock()
                .unwrap()
                .push((attempt.attempt, attempt.total_attempts, attempt.next_delay));
        };
        let _ = execute_with_retry(
            || async { Err::<(), _>("connection reset") },
            &RetryPolicy::standard(),
            RetryOptions {
                on_retry: Some(&on_retry),
                cancel: None,
            },
        )
        .await
        .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen,
            vec![
                (1, 4, Duration::from_millis(1_000)),
                (2, 4, Duration::from_millis(2_000)),
                (3, 4, Duration::from_millis(4_000)),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_attempt() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        token.cancel();
        let result = execute_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            },
            &RetryPolicy::standard(),
            RetryOptions {
                on_retry: None,
                cancel: Some(token),
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Operation aborted");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_next_attempt() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let canceller = token.clone();
        let result = execute_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                canceller.cancel();
                async { Err::<(), _>("network glitch") }
            },
            &RetryPolicy::standard(),
            RetryOptions {
                on_retry: None,
                cancel: Some(token),
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), OperationAborted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rate_limit_policy_retries_throttling() {
        let throttled = RetryPolicy::rate_limited();
        assert!(should_retry("Rate limit exceeded: slow down", &throttled));
        assert!(!should_retry("Rate limit exceeded", &RetryPolicy::standard()));
        assert!(!should_retry("user rejected (rate limit)", &throttled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_policy_waits_out_rate_limit() {
        let calls = AtomicU32::new(0);
        let result = execute_with_error_policy(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("rate limit exceeded: too many requests".to_owned())
                    } else {
                        Ok(n)
                    }
                }
            },
            &RetryPolicy::standard(),
            RetryOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.outcome, Ok(1));
        assert_eq!(result.attempts_made, 2);
        assert_eq!(result.policy_used, "rate-limit");
        assert_eq!(result.total_time, Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_policy_gives_network_failures_more_attempts() {
        let result = execute_with_error_policy(
            || async { Err::<(), _>("network unreachable") },
            &RetryPolicy::fail_fast(),
            RetryOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(result.attempts_made, RetryPolicy::network().total_attempts());
        assert_eq!(result.policy_used, "network");
    }
}
