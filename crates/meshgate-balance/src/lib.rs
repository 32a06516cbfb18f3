//! meshgate-balance — picks one instance per request.
//!
//! Strategies are selected per route: round-robin, weighted-random, and
//! least-outstanding-requests. Instances whose breaker is open never
//! become candidates. Half-open instances stay in rotation so they can
//! take their single trial call, which also keeps a service reachable
//! when every other breaker is open.

pub mod balancer;
pub mod in_flight;

pub use balancer::{LoadBalancer, SelectError, Selection};
pub use in_flight::{InFlightGuard, InFlightTracker};
