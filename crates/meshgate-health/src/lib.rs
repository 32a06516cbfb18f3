//! meshgate-health — active health checking for discovered instances.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── sync() against DiscoveryCoalescer::tracked()
//!   ├── Per-instance background task
//!   │   ├── HealthTracker (consecutive results, backoff)
//!   │   └── http_probe() → ProbeResult
//!   └── DiscoveryEvent::HealthChanged → coalescer → InstanceRegistry
//! ```
//!
//! Sustained probe failure ejects an instance from the published set.
//! Backoff doubles from the check interval up to 60s while an instance
//! keeps failing, and a success resets it.

pub mod checker;
pub mod monitor;

pub use checker::{HealthStatus, HealthTracker, ProbeResult, http_probe};
pub use monitor::HealthMonitor;
