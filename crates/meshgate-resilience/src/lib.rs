//! meshgate-resilience — failure accounting around upstream calls.
//!
//! # State machine
//!
//! ```text
//!            failures >= threshold within window
//!   CLOSED ─────────────────────────────────────▶ OPEN
//!     ▲                                            │ cool-down elapsed
//!     │ trial succeeds                             ▼
//!     └──────────────────────────────────────── HALF_OPEN
//!                      trial fails ──▶ OPEN (cool-down restarts)
//! ```
//!
//! While OPEN, calls are rejected without being attempted. HALF_OPEN
//! admits exactly one trial call at a time.
//!
//! # Components
//!
//! - **`breaker`** — `CircuitBreaker` and the keyed `BreakerRegistry`
//! - **`deadline`** — absolute request deadlines
//! - **`retry`** — retry budget and failure classification

pub mod breaker;
pub mod deadline;
pub mod retry;

pub use breaker::{
    BreakerKey, BreakerPermit, BreakerRegistry, BreakerRejected, CircuitBreaker, Outcome, PolicyView, Ticket,
};
pub use deadline::Deadline;
pub use retry::{AttemptWindow, BudgetError, Disposition, ForwardError, RetryBudget, classify};
