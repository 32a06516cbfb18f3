//! Outstanding request counts per instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use meshgate_core::{Instance, InstanceSet, ServiceName};

type Key = (ServiceName, String);

fn key(instance: &Instance) -> Key {
    (instance.service.clone(), instance.endpoint())
}

/// Counts requests currently in flight to each instance.
#[derive(Default)]
pub struct InFlightTracker {
    counts: DashMap<Key, Arc<AtomicUsize>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for an instance; unknown instances have zero.
    pub fn get(&self, instance: &Instance) -> usize {
        self.counts
            .get(&key(instance))
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Count one more request. The count drops again when the guard does.
    pub fn acquire(&self, instance: &Instance) -> InFlightGuard {
        let counter = self
            .counts
            .entry(key(instance))
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { counter }
    }

    /// Forget counters for instances of `set`'s service that are no
    /// longer in it. Outstanding guards keep their own counter.
    pub fn prune(&self, set: &InstanceSet) {
        self.counts
            .retain(|(service, endpoint), _| service != set.service() || set.get(endpoint).is_some());
    }

    /// Number of instances with a counter.
    pub fn tracked(&self) -> usize {
        self.counts.len()
    }
}

/// Holds one unit of an instance's in-flight count.
///
/// Attach it to whatever lives as long as the request, typically the
/// response body, so streaming responses stay counted until done.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
