//! Instance selection strategies.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use meshgate_core::{BreakerState, BreakerStateView, Instance, InstanceSet, LbStrategy, ServiceName};

use crate::in_flight::{InFlightGuard, InFlightTracker};

/// Why no instance could be selected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("service {service} has no live instances")]
    NoInstances { service: ServiceName },

    #[error("every instance of {service} was already tried")]
    AllExcluded { service: ServiceName },

    #[error("circuit breakers are open for every instance of {service}")]
    AllOpen { service: ServiceName },
}

/// A selected instance plus its in-flight reservation.
#[derive(Debug)]
pub struct Selection {
    pub instance: Arc<Instance>,
    /// Breaker position at selection time.
    pub breaker_state: BreakerState,
    pub guard: InFlightGuard,
}

/// Selects instances from a service's snapshot.
///
/// Keeps one rotating cursor per service (shared by round-robin and the
/// least-outstanding tie-break) and the in-flight counts.
#[derive(Default)]
pub struct LoadBalancer {
    cursors: DashMap<ServiceName, Arc<AtomicUsize>>,
    in_flight: InFlightTracker,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> &InFlightTracker {
        &self.in_flight
    }

    /// Drop per-instance state for instances that left `set`, and the
    /// service cursor once it has no instances at all.
    pub fn prune(&self, set: &InstanceSet) {
        self.in_flight.prune(set);
        if set.is_empty() {
            self.cursors.remove(set.service());
        }
    }

    /// Pick one instance from `set`.
    ///
    /// Instances whose endpoint is in `excluded` (already tried by this
    /// request) and instances whose breaker is open are skipped.
    /// Half-open instances whose trial slot is free stay candidates and
    /// take their trial at their normal turn, so a recovered backend
    /// rejoins rotation once its cool-down has elapsed. This is
    /// deliberate: half-open instances are not reserved as a fallback for
    /// when every closed instance is unavailable.
    pub fn select(
        &self,
        set: &InstanceSet,
        strategy: LbStrategy,
        excluded: &HashSet<String>,
        breakers: &dyn BreakerStateView,
    ) -> Result<Selection, SelectError> {
        let service = set.service();
        if set.is_empty() {
            return Err(SelectError::NoInstances {
                service: service.clone(),
            });
        }

        let mut candidates = Vec::with_capacity(set.len());
        let mut states = Vec::with_capacity(set.len());
        let mut any_eligible = false;

        for instance in set.iter() {
            if excluded.contains(&instance.endpoint()) {
                continue;
            }
            any_eligible = true;
            match breakers.breaker_state(instance) {
                BreakerState::Open => {}
                state => {
                    candidates.push(instance.clone());
                    states.push(state);
                }
            }
        }

        if !any_eligible {
            return Err(SelectError::AllExcluded {
                service: service.clone(),
            });
        }
        if candidates.is_empty() {
            return Err(SelectError::AllOpen {
                service: service.clone(),
            });
        }
        if states.iter().all(|s| *s == BreakerState::HalfOpen) {
            debug!(service = %service, candidates = candidates.len(), "only half-open instances remain");
        }

        let idx = match strategy {
            LbStrategy::RoundRobin => self.next_cursor(service) % candidates.len(),
            LbStrategy::WeightedRandom => pick_weighted(&candidates, &mut rand::thread_rng()),
            LbStrategy::LeastOutstanding => self.pick_least_outstanding(service, &candidates),
        };
        let instance = candidates[idx].clone();
        let breaker_state = states[idx];

        debug!(
            service = %service,
            endpoint = %instance.endpoint(),
            %strategy,
            candidates = candidates.len(),
            "instance selected"
        );

        let guard = self.in_flight.acquire(&instance);
        Ok(Selection {
            instance,
            breaker_state,
            guard,
        })
    }

    fn next_cursor(&self, service: &ServiceName) -> usize {
        let cursor = self
            .cursors
            .entry(service.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Minimum in-flight count; ties go to the first candidate at or
    /// after the rotating cursor.
    fn pick_least_outstanding(&self, service: &ServiceName, candidates: &[Arc<Instance>]) -> usize {
        let n = candidates.len();
        let start = self.next_cursor(service) % n;

        let mut best = start;
        let mut best_count = usize::MAX;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let count = self.in_flight.get(&candidates[idx]);
            if count < best_count {
                best = idx;
                best_count = count;
            }
        }
        best
    }
}

/// Probability proportional to weight. Zero-weight instances are only
/// picked (uniformly) when every candidate has zero weight.
fn pick_weighted<R: Rng + ?Sized>(candidates: &[Arc<Instance>], rng: &mut R) -> usize {
    let total: u64 = candidates.iter().map(|i| u64::from(i.weight)).sum();
    if total == 0 {
        return rng.gen_range(0..candidates.len());
    }

    let mut threshold = rng.gen_range(0..total);
    for (idx, instance) in candidates.iter().enumerate() {
        let weight = u64::from(instance.weight);
        if threshold < weight {
            return idx;
        }
        threshold -= weight;
    }
    candidates.len() - 1
}
