//! Per-route traffic policy: timeouts, retries, load balancing, breakers.
//!
//! The defaults here are placeholders. Every field can be overridden
//! globally in `[defaults]` and again per route.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::error::ConfigError;

/// Instance selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    WeightedRandom,
    LeastOutstanding,
}

impl fmt::Display for LbStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LbStrategy::RoundRobin => "round_robin",
            LbStrategy::WeightedRandom => "weighted_random",
            LbStrategy::LeastOutstanding => "least_outstanding",
        };
        f.write_str(label)
    }
}

/// What a circuit breaker guards: one instance, or the service as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    #[default]
    Instance,
    Service,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerPolicy {
    /// Failures within `window` that trip CLOSED → OPEN.
    pub failure_threshold: u32,
    #[serde(with = "duration::required")]
    pub window: Duration,
    /// Time spent OPEN before a trial call is admitted.
    #[serde(with = "duration::required")]
    pub cool_down: Duration,
    pub scope: BreakerScope,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(10),
            cool_down: Duration::from_secs(30),
            scope: BreakerScope::Instance,
        }
    }
}

/// A forwarding outcome that may be retried against another instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RetryCondition {
    /// TCP connect refused/reset or handshake failure.
    ConnectFailure,
    /// The per-try timeout elapsed.
    Timeout,
    /// Any 5xx from the upstream.
    AnyServerError,
    /// One specific upstream status.
    Status(u16),
}

impl FromStr for RetryCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connect_failure" => Ok(RetryCondition::ConnectFailure),
            "timeout" => Ok(RetryCondition::Timeout),
            "5xx" => Ok(RetryCondition::AnyServerError),
            other => match other.parse::<u16>() {
                Ok(code) if (100..=599).contains(&code) => Ok(RetryCondition::Status(code)),
                _ => Err(format!("unknown retry condition: {s:?}")),
            },
        }
    }
}

impl TryFrom<String> for RetryCondition {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RetryCondition> for String {
    fn from(c: RetryCondition) -> Self {
        match c {
            RetryCondition::ConnectFailure => "connect_failure".to_string(),
            RetryCondition::Timeout => "timeout".to_string(),
            RetryCondition::AnyServerError => "5xx".to_string(),
            RetryCondition::Status(code) => code.to_string(),
        }
    }
}

/// Retry budget and classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// A retry is skipped if less than this much of the deadline remains.
    #[serde(with = "duration::required")]
    pub min_retry_window: Duration,
    pub retry_on: Vec<RetryCondition>,
    /// Permit retrying methods that are not idempotent (POST, PATCH).
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            min_retry_window: Duration::from_millis(100),
            retry_on: vec![
                RetryCondition::ConnectFailure,
                RetryCondition::Timeout,
                RetryCondition::Status(502),
                RetryCondition::Status(503),
                RetryCondition::Status(504),
            ],
            retry_non_idempotent: false,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn retries_connect_failure(&self) -> bool {
        self.retry_on.contains(&RetryCondition::ConnectFailure)
    }

    pub fn retries_timeout(&self) -> bool {
        self.retry_on.contains(&RetryCondition::Timeout)
    }

    pub fn retries_status(&self, status: u16) -> bool {
        self.retry_on.iter().any(|c| match c {
            RetryCondition::Status(code) => *code == status,
            RetryCondition::AnyServerError => (500..600).contains(&status),
            _ => false,
        })
    }
}

/// Fully resolved policy attached to a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Overall request deadline, measured from ingress.
    #[serde(with = "duration::required")]
    pub timeout: Duration,
    /// Upper bound for a single forwarding attempt.
    #[serde(default, with = "duration::optional")]
    pub per_try_timeout: Option<Duration>,
    pub lb: LbStrategy,
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            per_try_timeout: None,
            lb: LbStrategy::default(),
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
        }
    }
}

/// Longest duration any policy field may carry.
pub const MAX_POLICY_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

impl RoutePolicy {
    /// Reject policies that cannot work at runtime.
    pub fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPolicy {
            scope: scope.to_string(),
            reason: reason.to_string(),
        };

        if self.timeout.is_zero() {
            return Err(invalid("timeout must be greater than zero"));
        }
        if self.per_try_timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid("per_try_timeout must be greater than zero"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        if self.breaker.window.is_zero() {
            return Err(invalid("breaker.window must be greater than zero"));
        }

        let bounded = [
            ("timeout", Some(self.timeout)),
            ("per_try_timeout", self.per_try_timeout),
            ("retry.min_retry_window", Some(self.retry.min_retry_window)),
            ("breaker.window", Some(self.breaker.window)),
            ("breaker.cool_down", Some(self.breaker.cool_down)),
        ];
        for (field, value) in bounded {
            if value.is_some_and(|d| d > MAX_POLICY_DURATION) {
                return Err(invalid(&format!(
                    "{field} must not exceed {}",
                    duration::format_duration(MAX_POLICY_DURATION)
                )));
            }
        }
        Ok(())
    }
}
