//! Retry classification and the per-request attempt budget.

use std::time::Duration;

use http::Method;
use thiserror::Error;

use meshgate_core::RetryPolicy;

use crate::deadline::Deadline;

/// Why a single forwarding attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    /// The connection could not be established. The request was not sent.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The attempt's own timeout elapsed.
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    /// The upstream answered with a status the route retries on.
    #[error("upstream returned status {0}")]
    Status(u16),

    /// The upstream broke the protocol or dropped the connection mid-exchange.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl ForwardError {
    /// Whether the failure says something about backend health.
    pub fn counts_against_breaker(&self) -> bool {
        match self {
            ForwardError::Connect(_) | ForwardError::Timeout(_) | ForwardError::Protocol(_) => true,
            ForwardError::Status(status) => *status >= 500,
        }
    }

    /// Stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Connect(_) => "connect_failure",
            ForwardError::Timeout(_) => "timeout",
            ForwardError::Status(_) => "upstream_status",
            ForwardError::Protocol(_) => "protocol",
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Select another instance and try again, budget permitting.
    Retry,
    /// Surface the failure to the caller.
    Terminal,
}

/// Methods that can be repeated without changing the outcome.
fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}

/// Decide whether a failure may be retried under `policy`.
///
/// A connect failure never reached the upstream, so it is retryable for
/// any method. Anything else on a non-idempotent method is terminal
/// unless the route opts in with `retry_non_idempotent`.
pub fn classify(policy: &RetryPolicy, method: &Method, error: &ForwardError) -> Disposition {
    let listed = match error {
        ForwardError::Connect(_) => return retry_if(policy.retries_connect_failure()),
        ForwardError::Timeout(_) => policy.retries_timeout(),
        ForwardError::Status(status) => policy.retries_status(*status),
        ForwardError::Protocol(_) => false,
    };

    retry_if(listed && (is_idempotent(method) || policy.retry_non_idempotent))
}

fn retry_if(retry: bool) -> Disposition {
    if retry { Disposition::Retry } else { Disposition::Terminal }
}

/// The attempt budget would be overrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error("retry budget exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("only {remaining:?} left before the deadline")]
    DeadlineTooClose { remaining: Duration },

    #[error("request deadline expired")]
    DeadlineExpired,
}

/// Time granted to one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptWindow {
    /// 1-based attempt number.
    pub attempt: u32,
    pub timeout: Duration,
    /// The overall deadline, not the per-try timeout, bounds this attempt.
    /// When it fires the request is out of time rather than the upstream
    /// being slow.
    pub bounded_by_deadline: bool,
}

/// Counts attempts for one request against a shared deadline.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_attempts: u32,
    min_retry_window: Duration,
    attempts: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, min_retry_window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_retry_window,
            attempts: 0,
        }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.max_attempts(), policy.min_retry_window)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Reserve the next attempt, recomputing the time left first.
    ///
    /// The minimum retry window applies to retries only; the first
    /// attempt always runs if any time remains.
    pub fn begin_attempt(
        &mut self,
        deadline: &Deadline,
        per_try_timeout: Option<Duration>,
    ) -> Result<AttemptWindow, BudgetError> {
        if self.attempts >= self.max_attempts {
            return Err(BudgetError::Exhausted {
                attempts: self.attempts,
            });
        }

        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(BudgetError::DeadlineExpired);
        }
        if self.attempts > 0 && remaining < self.min_retry_window {
            return Err(BudgetError::DeadlineTooClose { remaining });
        }

        self.attempts += 1;
        let (timeout, bounded_by_deadline) = match per_try_timeout {
            Some(per_try) if per_try < remaining => (per_try, false),
            _ => (remaining, true),
        };

        Ok(AttemptWindow {
            attempt: self.attempts,
            timeout,
            bounded_by_deadline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_core::RetryCondition;

    #[test]
    fn default_policy_classification() {
        let policy = RetryPolicy::default();

        assert_eq!(
            classify(&policy, &Method::GET, &ForwardError::Connect("refused".into())),
            Disposition::Retry
        );
        assert_eq!(
            classify(&policy, &Method::GET, &ForwardError::Timeout(Duration::from_secs(1))),
            Disposition::Retry
        );
        assert_eq!(classify(&policy, &Method::GET, &ForwardError::Status(503)), Disposition::Retry);
        assert_eq!(classify(&policy, &Method::GET, &ForwardError::Status(500)), Disposition::Terminal);
        assert_eq!(classify(&policy, &Method::GET, &ForwardError::Status(404)), Disposition::Terminal);
        assert_eq!(
            classify(&policy, &Method::GET, &ForwardError::Protocol("reset".into())),
            Disposition::Terminal
        );
    }

    #[test]
    fn non_idempotent_only_retries_unsent_requests() {
        let policy = RetryPolicy::default();

        assert_eq!(
            classify(&policy, &Method::POST, &ForwardError::Connect("refused".into())),
            Disposition::Retry
        );
        assert_eq!(classify(&policy, &Method::POST, &ForwardError::Status(503)), Disposition::Terminal);
        assert_eq!(
            classify(&policy, &Method::PATCH, &ForwardError::Timeout(Duration::from_secs(1))),
            Disposition::Terminal
        );

        let opted_in = RetryPolicy {
            retry_non_idempotent: true,
            ..RetryPolicy::default()
        };
        assert_eq!(classify(&opted_in, &Method::POST, &ForwardError::Status(503)), Disposition::Retry);
    }

    #[test]
    fn unlisted_conditions_are_terminal() {
        let policy = RetryPolicy {
            retry_on: vec![RetryCondition::Status(503)],
            ..RetryPolicy::default()
        };
        assert_eq!(
            classify(&policy, &Method::GET, &ForwardError::Connect("refused".into())),
            Disposition::Terminal
        );
        assert_eq!(
            classify(&policy, &Method::GET, &ForwardError::Timeout(Duration::from_secs(1))),
            Disposition::Terminal
        );
    }

    #[test]
    fn breaker_accounting_by_error() {
        assert!(ForwardError::Connect("x".into()).counts_against_breaker());
        assert!(ForwardError::Timeout(Duration::from_secs(1)).counts_against_breaker());
        assert!(ForwardError::Status(502).counts_against_breaker());
        assert!(!ForwardError::Status(429).counts_against_breaker());
    }

    #[tokio::test(start_paused = true)]
    async fn budget_caps_attempts() {
        let deadline = Deadline::after(Duration::from_secs(30));
        let mut budget = RetryBudget::new(3, Duration::from_millis(100));

        for expected in 1..=3 {
            let window = budget.begin_attempt(&deadline, None).unwrap();
            assert_eq!(window.attempt, expected);
        }
        assert!(budget.is_last_attempt());
        assert_eq!(
            budget.begin_attempt(&deadline, None),
            Err(BudgetError::Exhausted { attempts: 3 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_bounded_by_remaining_time() {
        let deadline = Deadline::after(Duration::from_secs(2));
        let mut budget = RetryBudget::new(3, Duration::from_millis(100));

        let first = budget
            .begin_attempt(&deadline, Some(Duration::from_millis(1500)))
            .unwrap();
        assert_eq!(first.timeout, Duration::from_millis(1500));
        assert!(!first.bounded_by_deadline);

        tokio::time::advance(Duration::from_millis(1500)).await;
        let second = budget
            .begin_attempt(&deadline, Some(Duration::from_millis(1500)))
            .unwrap();
        assert_eq!(second.timeout, Duration::from_millis(500));
        assert!(second.bounded_by_deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_skipped_when_window_too_small() {
        let deadline = Deadline::after(Duration::from_secs(2));
        let mut budget = RetryBudget::new(3, Duration::from_secs(1));

        budget
            .begin_attempt(&deadline, Some(Duration::from_millis(1500)))
            .unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;

        assert_eq!(
            budget.begin_attempt(&deadline, Some(Duration::from_millis(1500))),
            Err(BudgetError::DeadlineTooClose {
                remaining: Duration::from_millis(500)
            })
        );
        assert_eq!(budget.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_ignores_min_window_but_not_expiry() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let mut budget = RetryBudget::new(3, Duration::from_secs(1));
        assert!(budget.begin_attempt(&deadline, None).is_ok());

        let expired = Deadline::after(Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(10)).await;
        let mut budget = RetryBudget::new(3, Duration::ZERO);
        assert_eq!(budget.begin_attempt(&expired, None), Err(BudgetError::DeadlineExpired));
    }
}
