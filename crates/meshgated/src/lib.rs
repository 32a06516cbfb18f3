//! meshgated — wiring for the meshgate gateway daemon.
//!
//! The binary in `main.rs` is thin; the pieces it assembles live here
//! so they can be tested without a process:
//!
//! - **`reload`** — loads configuration, installs routes and static
//!   services all-or-nothing, and reloads on SIGHUP or file change
//! - **`discovery_api`** — axum push API through which external
//!   discovery sources register, heartbeat, and deregister instances
//! - **`check`** — human-readable dump of a compiled route table

pub mod check;
pub mod discovery_api;
pub mod reload;

pub use discovery_api::{DiscoveryState, build_router};
pub use reload::ConfigReloader;
