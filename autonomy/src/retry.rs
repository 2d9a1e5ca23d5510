//! Retry policies and backoff
//!
//! Every [`ErrorCategory`] carries an immutable [`RetryPolicy`]. Delay for
//! attempt `n` (0-indexed) is `min(initial * base^n, max_delay)`, scaled by a
//! uniform factor in `[0.5, 1.5)` when jitter is enabled.
//!
//! [`run_with_retry`] is the generic helper used around sub-operations inside a
//! session. The caller names the category it *expects*, but each failure is
//! reclassified from its actual text and the actual category's policy decides
//! whether and when to retry:
//!
//! ```text
//! op() ─┬─ Ok(v) ──────────────────────────────→ Ok(v)
//!       └─ Err(e) → classify(e) → policy(actual)
//!                     ├─ attempt < max_retries → sleep(delay_for(actual, attempt)) → op()
//!                     └─ otherwise ─────────────→ Err(e)
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::{classify, ErrorCategory};

/// Backoff parameters for one error category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. Zero means never retry.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,
    /// Multiplier per attempt (>= 1.0).
    pub exponential_base: f64,
    /// Scale each delay by a random factor in [0.5, 1.5).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry budget and initial delay, other fields default.
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Self::default()
        }
    }

    /// Override the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay for `attempt`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.exponential_base.max(1.0);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * base.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay for `attempt`, with jitter applied when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            let factor: f64 = rand::rng().random_range(0.5..1.5);
            base.mul_f64(factor)
        } else {
            base
        }
    }
}

/// Per-category retry table.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    policies: HashMap<ErrorCategory, RetryPolicy>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let secs = Duration::from_secs;
        let policies = HashMap::from([
            (ErrorCategory::Transient, RetryPolicy::new(10, secs(1))),
            (
                ErrorCategory::RateLimit,
                RetryPolicy::new(5, secs(30)).with_max_delay(secs(600)),
            ),
            (ErrorCategory::Auth, RetryPolicy::new(1, Duration::ZERO)),
            (ErrorCategory::Resource, RetryPolicy::new(3, secs(5))),
            (
                ErrorCategory::ExternalApi,
                RetryPolicy::new(8, secs(5)).with_max_delay(secs(120)),
            ),
            (ErrorCategory::BrowserAutomation, RetryPolicy::new(5, secs(3))),
            (ErrorCategory::PolicyBlocked, RetryPolicy::new(0, secs(2))),
            (ErrorCategory::Unknown, RetryPolicy::new(5, secs(5))),
        ]);
        Self { policies }
    }
}

impl RetryPolicies {
    /// Empty table; every lookup falls back to the default policy.
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    /// Replace the policy for one category.
    pub fn with_policy(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
        self.policies.insert(category, policy);
        self
    }

    /// Same table with jitter disabled everywhere (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        for policy in self.policies.values_mut() {
            policy.jitter = false;
        }
        self
    }

    /// Policy for `category`, falling back to the Unknown policy.
    pub fn policy(&self, category: ErrorCategory) -> RetryPolicy {
        self.policies
            .get(&category)
            .or_else(|| self.policies.get(&ErrorCategory::Unknown))
            .copied()
            .unwrap_or_default()
    }

    /// Whether this table retries `category` at all.
    pub fn is_retriable(&self, category: ErrorCategory) -> bool {
        self.policy(category).max_retries > 0
    }

    /// Delay before retry `attempt` of a `category` failure.
    pub fn delay_for(&self, category: ErrorCategory, attempt: u32) -> Duration {
        self.policy(category).delay(attempt)
    }
}

/// One scheduled retry, reported to observers before the backoff sleep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    /// 1-based retry number.
    pub attempt: u32,
    /// Retry budget of the actual category.
    pub max_retries: u32,
    /// Category the call-site declared.
    pub expected: ErrorCategory,
    /// Category the failure actually classified as.
    pub actual: ErrorCategory,
    /// Backoff about to be slept.
    pub delay: Duration,
}

/// Run `operation`, retrying per the policy of each failure's actual category.
///
/// Returns the last error once the actual category's retry budget is spent.
pub async fn run_with_retry<T, E, F, Fut>(
    policies: &RetryPolicies,
    expected: ErrorCategory,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    run_with_retry_observed(policies, expected, |_| {}, operation).await
}

/// [`run_with_retry`] with a callback invoked before every backoff sleep.
pub async fn run_with_retry_observed<T, E, F, Fut, O>(
    policies: &RetryPolicies,
    expected: ErrorCategory,
    mut on_retry: O,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    O: FnMut(&RetryAttempt),
{
    let mut attempt: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let actual = classify(&err.to_string());
        let policy = policies.policy(actual);

        if actual != expected {
            debug!(%expected, %actual, "failure reclassified");
        }

        if attempt >= policy.max_retries {
            warn!(
                category = %actual,
                attempts = attempt + 1,
                error = %err,
                "retries exhausted"
            );
            return Err(err);
        }

        let delay = policy.delay(attempt);
        let retry = RetryAttempt {
            attempt: attempt + 1,
            max_retries: policy.max_retries,
            expected,
            actual,
            delay,
        };
        on_retry(&retry);

        warn!(
            category = %actual,
            attempt = retry.attempt,
            max_retries = retry.max_retries,
            delay_secs = delay.as_secs_f64(),
            error = %err,
            "retrying after failure"
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_default_table_matches_categories() {
        let policies = RetryPolicies::default();
        assert_eq!(policies.policy(ErrorCategory::PolicyBlocked).max_retries, 0);
        let auth = policies.policy(ErrorCategory::Auth);
        assert_eq!(auth.max_retries, 1);
        assert_eq!(auth.initial_delay, Duration::ZERO);
        assert_eq!(policies.delay_for(ErrorCategory::Auth, 3), Duration::ZERO);
        assert_eq!(
            policies.policy(ErrorCategory::RateLimit).max_delay,
            Duration::from_secs(600)
        );
        for category in ErrorCategory::ALL {
            assert_eq!(category.is_retriable(), policies.is_retriable(category), "{category}");
        }

        let strict = RetryPolicies::default()
            .with_policy(ErrorCategory::Transient, RetryPolicy::new(0, Duration::ZERO));
        assert!(!strict.is_retriable(ErrorCategory::Transient));
        assert!(strict.is_retriable(ErrorCategory::Unknown));
    }

    #[test]
    fn test_missing_category_falls_back_to_unknown() {
        let unknown = RetryPolicy::new(7, Duration::from_secs(9));
        let policies = RetryPolicies::empty().with_policy(ErrorCategory::Unknown, unknown);
        assert_eq!(policies.policy(ErrorCategory::Resource), unknown);
    }

    #[test]
    fn test_base_delay_exponential_and_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(false);
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(400), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_non_decreasing_without_jitter() {
        let policies = RetryPolicies::default().without_jitter();
        for category in ErrorCategory::ALL {
            let max = policies.policy(category).max_delay;
            let mut previous = Duration::ZERO;
            for n in 0..40 {
                let delay = policies.delay_for(category, n);
                assert!(delay >= previous, "{category} attempt {n}");
                assert!(delay <= max);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_jitter_bounded() {
        let policies = RetryPolicies::default();
        for category in ErrorCategory::ALL {
            let policy = policies.policy(category);
            let bound = policy.max_delay.mul_f64(1.5);
            for n in 0..20 {
                let delay = policy.delay(n);
                assert!(delay <= bound, "{category} attempt {n}: {delay:?}");
                assert!(delay >= policy.base_delay(n).mul_f64(0.5));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policies = RetryPolicies::default().without_jitter();
        let calls = Cell::new(0);

        let result: Result<u32, String> =
            run_with_retry(&policies, ErrorCategory::Transient, || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err("connection reset".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actual_category_policy_wins() {
        let policies = RetryPolicies::default().without_jitter();
        let mut seen = Vec::new();

        let result: Result<(), String> = run_with_retry_observed(
            &policies,
            ErrorCategory::Transient,
            |retry| seen.push(retry.clone()),
            || async { Err("429 too many requests".to_string()) },
        )
        .await;

        assert!(result.is_err());
        // rate-limit budget (5), not the transient budget (10)
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|r| r.actual == ErrorCategory::RateLimit));
        assert!(seen.iter().all(|r| r.expected == ErrorCategory::Transient));
        assert_eq!(seen[0].delay, Duration::from_secs(30));
        assert_eq!(seen[1].delay, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_blocked_never_retried() {
        let policies = RetryPolicies::default();
        let calls = Cell::new(0);

        let result: Result<(), String> = run_with_retry(&policies, ErrorCategory::Unknown, || {
            calls.set(calls.get() + 1);
            async { Err("Command 'rm' is not allowed".to_string()) }
        })
        .await;

        assert_eq!(result, Err("Command 'rm' is not allowed".to_string()));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_retried_once_without_delay() {
        let policies = RetryPolicies::default();
        let calls = Cell::new(0);
        let start = tokio::time::Instant::now();

        let result: Result<(), String> = run_with_retry(&policies, ErrorCategory::Transient, || {
            calls.set(calls.get() + 1);
            async { Err("401 Unauthorized".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
