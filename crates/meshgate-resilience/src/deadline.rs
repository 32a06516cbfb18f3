//! Absolute request deadlines.

use std::time::Duration;

use tokio::time::Instant;

/// Stand-in for "never" when a timeout does not fit the clock.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// A fixed point in time by which a request must be answered.
///
/// Set once at ingress; every attempt and every wait is measured
/// against the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self::starting_at(Instant::now(), timeout)
    }

    pub fn starting_at(started: Instant, timeout: Duration) -> Self {
        let at = started
            .checked_add(timeout)
            .or_else(|| started.checked_add(FAR_FUTURE))
            .unwrap_or(started);
        Self { started, at }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    /// Time left; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Total budget the deadline was created with.
    pub fn budget(&self) -> Duration {
        self.at - self.started
    }
}
