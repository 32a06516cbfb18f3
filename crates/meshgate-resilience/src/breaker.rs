//! Circuit breakers, one per instance or per service.
//!
//! Each breaker keeps its state behind its own mutex, so every
//! acquire/record is a single linearizable step. Permits carry the
//! breaker generation they were issued in; an outcome reported against
//! an older generation is ignored. Two concurrent failures that both
//! cross the threshold therefore produce one CLOSED → OPEN transition.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use meshgate_core::{
    BreakerPolicy, BreakerScope, BreakerState, BreakerStateView, Instance, InstanceSet, ServiceName,
};

/// Result of a call, as far as breaker accounting is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// The call was short-circuited; the breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker for {key} is open")]
pub struct BreakerRejected {
    pub key: BreakerKey,
    /// Time until a trial call will be admitted, if known.
    pub retry_after: Option<Duration>,
}

/// What a breaker guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BreakerKey {
    Instance { service: ServiceName, endpoint: String },
    Service(ServiceName),
}

impl BreakerKey {
    pub fn for_instance(instance: &Instance, scope: BreakerScope) -> Self {
        match scope {
            BreakerScope::Instance => BreakerKey::Instance {
                service: instance.service.clone(),
                endpoint: instance.endpoint(),
            },
            BreakerScope::Service => BreakerKey::Service(instance.service.clone()),
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerKey::Instance { service, endpoint } => write!(f, "{service}/{endpoint}"),
            BreakerKey::Service(service) => write!(f, "{service}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open { since: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    /// Failure timestamps inside the current window (CLOSED only).
    failures: VecDeque<Instant>,
    generation: u64,
    last_transition: Instant,
    policy: BreakerPolicy,
}

impl Inner {
    fn transition(&mut self, key: &BreakerKey, phase: Phase, now: Instant) {
        let from = self.phase;
        self.phase = phase;
        self.generation += 1;
        self.last_transition = now;
        self.failures.clear();

        match phase {
            Phase::Open { .. } => warn!(
                breaker = %key,
                from = %label(from),
                cool_down_ms = self.policy.cool_down.as_millis() as u64,
                "circuit breaker opened"
            ),
            Phase::HalfOpen { .. } => info!(breaker = %key, "circuit breaker half-open, admitting trial"),
            Phase::Closed => info!(breaker = %key, "circuit breaker closed"),
        }
    }
}

fn label(phase: Phase) -> BreakerState {
    match phase {
        Phase::Closed => BreakerState::Closed,
        Phase::Open { .. } => BreakerState::Open,
        Phase::HalfOpen { .. } => BreakerState::HalfOpen,
    }
}

/// Issued by `try_acquire`; must be settled with `record` or `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
    trial: bool,
}

impl Ticket {
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// One breaker state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: BreakerKey,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(key: BreakerKey, policy: BreakerPolicy) -> Self {
        Self {
            key,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                failures: VecDeque::new(),
                generation: 0,
                last_transition: Instant::now(),
                policy,
            }),
        }
    }

    pub fn key(&self) -> &BreakerKey {
        &self.key
    }

    /// Ask to make a call. Rejected while OPEN, or while a HALF_OPEN
    /// trial is already in flight.
    pub fn try_acquire(&self) -> Result<Ticket, BreakerRejected> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> Result<Ticket, BreakerRejected> {
        let mut inner = self.inner.lock().expect("breaker lock");

        match inner.phase {
            Phase::Closed => Ok(Ticket {
                generation: inner.generation,
                trial: false,
            }),
            Phase::Open { since } => match cool_down_left(since, inner.policy.cool_down, now) {
                None => {
                    inner.transition(&self.key, Phase::HalfOpen { trial_in_flight: true }, now);
                    Ok(Ticket {
                        generation: inner.generation,
                        trial: true,
                    })
                }
                Some(left) => Err(BreakerRejected {
                    key: self.key.clone(),
                    retry_after: Some(left),
                }),
            },
            Phase::HalfOpen { trial_in_flight: true } => Err(BreakerRejected {
                key: self.key.clone(),
                retry_after: None,
            }),
            Phase::HalfOpen { trial_in_flight: false } => {
                inner.phase = Phase::HalfOpen { trial_in_flight: true };
                Ok(Ticket {
                    generation: inner.generation,
                    trial: true,
                })
            }
        }
    }

    /// Report a call's outcome.
    pub fn record(&self, ticket: Ticket, outcome: Outcome) {
        self.record_at(ticket, outcome, Instant::now());
    }

    fn record_at(&self, ticket: Ticket, outcome: Outcome, now: Instant) {
        let mut inner = self.inner.lock().expect("breaker lock");

        if ticket.generation != inner.generation {
            debug!(breaker = %self.key, ?outcome, "stale outcome ignored");
            return;
        }

        match (inner.phase, outcome) {
            (Phase::Closed, Outcome::Success) => inner.failures.clear(),
            (Phase::Closed, Outcome::Failure) => {
                let window = inner.policy.window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);

                let threshold = inner.policy.failure_threshold as usize;
                if inner.failures.len() >= threshold {
                    inner.transition(&self.key, Phase::Open { since: now }, now);
                }
            }
            (Phase::HalfOpen { .. }, Outcome::Success) if ticket.trial => {
                inner.transition(&self.key, Phase::Closed, now);
            }
            (Phase::HalfOpen { .. }, Outcome::Failure) if ticket.trial => {
                inner.transition(&self.key, Phase::Open { since: now }, now);
            }
            _ => {}
        }
    }

    /// Give a ticket back without an outcome (the call was cancelled).
    ///
    /// Nothing is counted. A released trial frees the HALF_OPEN slot.
    pub fn release(&self, ticket: Ticket) {
        let mut inner = self.inner.lock().expect("breaker lock");
        if ticket.trial
            && ticket.generation == inner.generation
            && inner.phase == (Phase::HalfOpen { trial_in_flight: true })
        {
            inner.phase = Phase::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    /// State machine position. An OPEN breaker whose cool-down has
    /// elapsed reports HALF_OPEN even before the next acquire moves it.
    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    fn state_at(&self, now: Instant) -> BreakerState {
        let inner = self.inner.lock().expect("breaker lock");
        match inner.phase {
            Phase::Open { since } if cool_down_left(since, inner.policy.cool_down, now).is_none() => {
                BreakerState::HalfOpen
            }
            phase => label(phase),
        }
    }

    /// Whether a call would be admitted right now, expressed as a state:
    /// `Open` when it would be rejected, `HalfOpen` when it would run as
    /// the trial.
    pub fn admission(&self) -> BreakerState {
        self.admission_at(Instant::now())
    }

    fn admission_at(&self, now: Instant) -> BreakerState {
        let inner = self.inner.lock().expect("breaker lock");
        match inner.phase {
            Phase::Closed => BreakerState::Closed,
            Phase::Open { since } if cool_down_left(since, inner.policy.cool_down, now).is_none() => {
                BreakerState::HalfOpen
            }
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen { trial_in_flight: true } => BreakerState::Open,
            Phase::HalfOpen { trial_in_flight: false } => BreakerState::HalfOpen,
        }
    }

    /// Failures counted in the current window.
    pub fn failure_count(&self) -> usize {
        self.inner.lock().expect("breaker lock").failures.len()
    }

    /// When the breaker last changed state.
    pub fn last_transition(&self) -> Instant {
        self.inner.lock().expect("breaker lock").last_transition
    }

    fn refresh_policy(&self, policy: &BreakerPolicy) {
        let mut inner = self.inner.lock().expect("breaker lock");
        if inner.policy != *policy {
            inner.policy = policy.clone();
        }
    }
}

/// Time left before an OPEN breaker admits a trial; `None` once elapsed.
fn cool_down_left(since: Instant, cool_down: Duration, now: Instant) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(since);
    cool_down.checked_sub(elapsed).filter(|left| !left.is_zero())
}

/// Admission to call an upstream, obtained from `BreakerRegistry::acquire`.
///
/// Dropping the permit without calling `record` releases it without
/// any accounting, which is what cancellation needs.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    ticket: Ticket,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.ticket.is_trial()
    }

    pub fn key(&self) -> &BreakerKey {
        self.breaker.key()
    }

    pub fn record(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.ticket, outcome);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.ticket);
        }
    }
}

/// All breakers, created lazily on first use.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<BreakerKey, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn breaker(&self, key: BreakerKey, policy: &BreakerPolicy) -> Arc<CircuitBreaker> {
        let breaker = self
            .breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, policy.clone())))
            .clone();
        breaker.refresh_policy(policy);
        breaker
    }

    /// Gate a call to `instance` under `policy`.
    pub fn acquire(
        &self,
        instance: &Instance,
        policy: &BreakerPolicy,
    ) -> Result<BreakerPermit, BreakerRejected> {
        let breaker = self.breaker(BreakerKey::for_instance(instance, policy.scope), policy);
        let ticket = breaker.try_acquire()?;
        Ok(BreakerPermit {
            breaker,
            ticket,
            settled: false,
        })
    }

    /// Look up an existing breaker.
    pub fn get(&self, key: &BreakerKey) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| b.clone())
    }

    /// Selection-time view for one route's breaker policy.
    pub fn view<'a>(&'a self, policy: &'a BreakerPolicy) -> PolicyView<'a> {
        PolicyView {
            registry: self,
            policy,
        }
    }

    /// Drop breakers whose instance left `set`. The service-wide breaker
    /// goes too once the set is empty.
    ///
    /// Permits already handed out keep their breaker alive until settled.
    pub fn prune(&self, set: &InstanceSet) {
        let service = set.service();
        let before = self.breakers.len();
        self.breakers.retain(|key, _| match key {
            BreakerKey::Instance { service: s, endpoint } => s != service || set.get(endpoint).is_some(),
            BreakerKey::Service(s) => s != service || !set.is_empty(),
        });
        let dropped = before.saturating_sub(self.breakers.len());
        if dropped > 0 {
            debug!(%service, dropped, "pruned breakers for departed instances");
        }
    }
}

/// `BreakerStateView` over a registry, resolving keys with one policy's scope.
pub struct PolicyView<'a> {
    registry: &'a BreakerRegistry,
    policy: &'a BreakerPolicy,
}

impl BreakerStateView for PolicyView<'_> {
    fn breaker_state(&self, instance: &Instance) -> BreakerState {
        let key = BreakerKey::for_instance(instance, self.policy.scope);
        self.registry
            .breakers
            .get(&key)
            .map(|b| b.admission())
            .unwrap_or(BreakerState::Closed)
    }
}
