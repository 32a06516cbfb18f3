//! meshgate-core — shared types for the meshgate API gateway.
//!
//! Holds the vocabulary every other crate speaks: service names,
//! backend instances and their immutable snapshots, per-route policy,
//! the TOML configuration model, and the error taxonomy.

pub mod config;
pub mod duration;
pub mod error;
pub mod policy;
pub mod types;

pub use config::GatewayConfig;
pub use error::{ConfigError, CoreError, CoreResult};
pub use policy::*;
pub use types::*;
