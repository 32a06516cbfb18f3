//! meshgate-proxy — the request path.
//!
//! # Architecture
//!
//! ```text
//! GatewayServer (hyper, one task per connection)
//!   └── Gateway::handle
//!         ├── SharedRouteTable::resolve      → RoutingFailure (404)
//!         └── per attempt, bounded by RetryBudget + Deadline
//!               ├── LoadBalancer::select     → NoInstanceAvailable / BreakerOpen (503)
//!               ├── BreakerRegistry::acquire
//!               ├── Forwarder::forward       → ForwardError
//!               └── BreakerPermit::record
//! ```
//!
//! Responses stream back through `TrackedBody`, which holds the
//! instance's in-flight count and enforces the request deadline.

pub mod body;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod server;

pub use body::{BoxError, ProxyBody, RequestBody, TrackedBody};
pub use context::RequestContext;
pub use error::{ERROR_KIND_HEADER, GatewayError};
pub use forwarder::{Forwarder, HttpUpstream, Upstream};
pub use gateway::{DEFAULT_MAX_REPLAYABLE_BODY_BYTES, Gateway};
pub use server::GatewayServer;
