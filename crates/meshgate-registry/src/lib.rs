//! meshgate-registry — live backend instances per service.
//!
//! # Components
//!
//! - **`cache`** — `InstanceRegistry`, one immutable `InstanceSet` per
//!   service, swapped atomically; readers never lock
//! - **`discovery`** — the `InstanceSetListener` adapter seam, plus a
//!   coalescer that folds incremental registration events into full sets
//!
//! ```text
//! discovery source ──events──▶ DiscoveryCoalescer ──full set──▶ InstanceRegistry
//!                                                                   │
//!                                        request tasks ◀──snapshot──┘
//! ```

pub mod cache;
pub mod discovery;

pub use cache::InstanceRegistry;
pub use discovery::{DiscoveryCoalescer, DiscoveryEvent, InstanceSetListener, StaticDiscovery, TrackedInstance};
