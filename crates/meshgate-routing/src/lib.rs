//! meshgate-routing — maps inbound requests to target services.
//!
//! Rules are evaluated in configured order and the first matching rule
//! wins. Operators rely on that precedence: a specific
//! `/api/v2/users/**` rule placed before a catch-all `/api/**` shadows it.
//!
//! # Components
//!
//! - **`pattern`** — segment-based path patterns and host patterns
//! - **`rule`** — `RouteRule`, compiled from a `[[routes]]` entry
//! - **`table`** — `RouteTable` and its atomically swapped handle

pub mod pattern;
pub mod rule;
pub mod table;

pub use pattern::{HostPattern, PathPattern};
pub use rule::{RoutePredicate, RouteRule};
pub use table::{RouteNotFound, RouteTable, SharedRouteTable};
