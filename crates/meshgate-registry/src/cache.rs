//! Instance registry cache — resolves service names to instance snapshots.
//!
//! The whole service map sits behind an `ArcSwap`. A reader loads the
//! current map and clones out the `Arc<InstanceSet>` it needs; a writer
//! builds a new map with the replaced set and stores it. A reader that
//! already holds a snapshot keeps using it untouched.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use meshgate_core::{InstanceSet, ServiceName};

use crate::discovery::InstanceSetListener;

type ServiceMap = HashMap<ServiceName, Arc<InstanceSet>>;

/// Last-known instance sets, one per service.
pub struct InstanceRegistry {
    services: ArcSwap<ServiceMap>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            services: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Current snapshot for a service. Unknown services yield an empty set.
    ///
    /// Never blocks.
    pub fn get_instances(&self, service: &ServiceName) -> Arc<InstanceSet> {
        self.services
            .load()
            .get(service)
            .cloned()
            .unwrap_or_else(|| Arc::new(InstanceSet::empty(service.clone())))
    }

    /// Replace the snapshot for `set.service()` in one swap.
    ///
    /// An empty set is published as-is; having no backends is a valid state.
    pub fn apply_update(&self, set: InstanceSet) {
        let service = set.service().clone();
        let count = set.len();
        let set = Arc::new(set);

        self.services.rcu(|current| {
            let mut next = ServiceMap::clone(current);
            next.insert(service.clone(), set.clone());
            next
        });

        debug!(service = %service, instances = count, "published instance set");
    }

    /// Make a service known without touching an existing snapshot.
    pub fn declare(&self, service: &ServiceName) {
        if self.contains(service) {
            return;
        }
        self.services.rcu(|current| {
            let mut next = ServiceMap::clone(current);
            next.entry(service.clone())
                .or_insert_with(|| Arc::new(InstanceSet::empty(service.clone())));
            next
        });
        debug!(service = %service, "declared service");
    }

    pub fn contains(&self, service: &ServiceName) -> bool {
        self.services.load().contains_key(service)
    }

    /// All known service names, sorted.
    pub fn list_services(&self) -> Vec<ServiceName> {
        let mut names: Vec<ServiceName> = self.services.load().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceSetListener for InstanceRegistry {
    fn on_instance_set_changed(&self, set: InstanceSet) {
        self.apply_update(set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_core::Instance;
    use std::thread;

    fn svc(name: &str) -> ServiceName {
        ServiceName::new(name).unwrap()
    }

    fn make_set(service: &str, hosts: &[&str]) -> InstanceSet {
        let name = svc(service);
        let instances = hosts
            .iter()
            .map(|h| Instance::new(name.clone(), *h, 8080))
            .collect();
        InstanceSet::new(name, instances).unwrap()
    }

    #[test]
    fn unknown_service_yields_empty_set() {
        let registry = InstanceRegistry::new();
        let set = registry.get_instances(&svc("ghost"));
        assert!(set.is_empty());
        assert_eq!(set.service().as_str(), "ghost");
        assert!(!registry.contains(&svc("ghost")));
    }

    #[test]
    fn apply_update_replaces_whole_set() {
        let registry = InstanceRegistry::new();
        registry.apply_update(make_set("api", &["10.0.0.1", "10.0.0.2"]));
        assert_eq!(registry.get_instances(&svc("api")).len(), 2);

        registry.apply_update(make_set("api", &["10.0.0.3"]));
        let set = registry.get_instances(&svc("API"));
        assert_eq!(set.len(), 1);
        assert!(set.get("10.0.0.3:8080").is_some());
    }

    #[test]
    fn held_snapshot_is_unaffected_by_update() {
        let registry = InstanceRegistry::new();
        registry.apply_update(make_set("api", &["10.0.0.1", "10.0.0.2"]));

        let held = registry.get_instances(&svc("api"));
        registry.apply_update(make_set("api", &[]));

        assert_eq!(held.len(), 2);
        assert!(registry.get_instances(&svc("api")).is_empty());
        assert!(registry.contains(&svc("api")));
    }

    #[test]
    fn declare_keeps_existing_snapshot() {
        let registry = InstanceRegistry::new();
        registry.apply_update(make_set("api", &["10.0.0.1"]));
        registry.declare(&svc("api"));
        registry.declare(&svc("web"));

        assert_eq!(registry.get_instances(&svc("api")).len(), 1);
        assert!(registry.contains(&svc("web")));
        assert_eq!(registry.list_services(), vec![svc("api"), svc("web")]);
    }

    #[test]
    fn concurrent_readers_never_see_torn_sets() {
        let registry = Arc::new(InstanceRegistry::new());
        let name = svc("api");

        let generation_set = |generation: u32| {
            let instances = (0..8)
                .map(|i| {
                    Instance::new(name.clone(), format!("10.0.{generation}.{i}"), 8080)
                        .with_metadata("generation", generation.to_string())
                })
                .collect();
            InstanceSet::new(name.clone(), instances).unwrap()
        };
        registry.apply_update(generation_set(0));

        let writer = {
            let registry = registry.clone();
            let sets: Vec<InstanceSet> = (1..200).map(generation_set).collect();
            thread::spawn(move || {
                for set in sets {
                    registry.apply_update(set);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let name = name.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let set = registry.get_instances(&name);
                        assert_eq!(set.len(), 8);
                        let first = set.instances()[0].metadata.get("generation").cloned();
                        assert!(set
                            .iter()
                            .all(|i| i.metadata.get("generation").cloned() == first));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
