//! Discovery adapters — bridge discovery sources to the registry cache.
//!
//! The registry only understands full-set replacement. Sources that
//! emit incremental events (register, heartbeat, deregister, health
//! changes) go through `DiscoveryCoalescer`, which keeps the current
//! membership per service and republishes the whole set after every
//! change. Unhealthy instances stay tracked but are left out of the
//! published set until they recover.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use meshgate_core::{Instance, InstanceSet, ServiceName};

/// Receives full-set replacements for one service at a time.
pub trait InstanceSetListener: Send + Sync {
    fn on_instance_set_changed(&self, set: InstanceSet);
}

/// Incremental membership change reported by a discovery source.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// An instance came up (or re-registered).
    Registered(Instance),
    /// Heartbeat carrying new weight or metadata.
    Updated {
        service: ServiceName,
        endpoint: String,
        weight: Option<u32>,
        metadata: Option<BTreeMap<String, String>>,
    },
    /// An instance went away.
    Deregistered {
        service: ServiceName,
        endpoint: String,
    },
    /// Active health checking changed its verdict.
    HealthChanged {
        service: ServiceName,
        endpoint: String,
        healthy: bool,
    },
}

/// An instance as tracked by the coalescer, including its health mark.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedInstance {
    pub instance: Instance,
    pub healthy: bool,
}

/// Folds discovery events into full instance sets.
///
/// All mutation and publication happens under one lock, so the listener
/// observes sets in the same order the events were applied.
pub struct DiscoveryCoalescer {
    listener: Arc<dyn InstanceSetListener>,
    services: Mutex<HashMap<ServiceName, Vec<TrackedInstance>>>,
}

impl DiscoveryCoalescer {
    pub fn new(listener: Arc<dyn InstanceSetListener>) -> Self {
        Self {
            listener,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one incremental event. Returns whether membership changed.
    pub fn apply(&self, event: DiscoveryEvent) -> bool {
        let mut services = self.services.lock().expect("discovery lock");

        let (service, changed) = match event {
            DiscoveryEvent::Registered(instance) => {
                let service = instance.service.clone();
                let tracked = services.entry(service.clone()).or_default();
                let endpoint = instance.endpoint();
                match tracked.iter_mut().find(|t| t.instance.endpoint() == endpoint) {
                    Some(existing) if existing.instance == instance => (service, false),
                    Some(existing) => {
                        existing.instance = instance;
                        (service, true)
                    }
                    None => {
                        info!(service = %service, %endpoint, "instance registered");
                        tracked.push(TrackedInstance {
                            instance,
                            healthy: true,
                        });
                        (service, true)
                    }
                }
            }
            DiscoveryEvent::Updated {
                service,
                endpoint,
                weight,
                metadata,
            } => {
                let changed = match find_mut(&mut services, &service, &endpoint) {
                    Some(tracked) => {
                        let before = tracked.instance.clone();
                        if let Some(weight) = weight {
                            tracked.instance.weight = weight;
                        }
                        if let Some(metadata) = metadata {
                            tracked.instance.metadata = metadata;
                        }
                        tracked.instance != before
                    }
                    None => {
                        debug!(service = %service, %endpoint, "update for unknown instance ignored");
                        false
                    }
                };
                (service, changed)
            }
            DiscoveryEvent::Deregistered { service, endpoint } => {
                let changed = match services.get_mut(&service) {
                    Some(tracked) => {
                        let before = tracked.len();
                        tracked.retain(|t| t.instance.endpoint() != endpoint);
                        before != tracked.len()
                    }
                    None => false,
                };
                if changed {
                    info!(service = %service, %endpoint, "instance deregistered");
                }
                (service, changed)
            }
            DiscoveryEvent::HealthChanged {
                service,
                endpoint,
                healthy,
            } => {
                let changed = match find_mut(&mut services, &service, &endpoint) {
                    Some(tracked) if tracked.healthy != healthy => {
                        tracked.healthy = healthy;
                        true
                    }
                    _ => false,
                };
                if changed {
                    if healthy {
                        info!(service = %service, %endpoint, "instance readmitted after health checks");
                    } else {
                        warn!(service = %service, %endpoint, "instance ejected after health checks");
                    }
                }
                (service, changed)
            }
        };

        if changed {
            self.publish(&service, services.get(&service).map(Vec::as_slice).unwrap_or(&[]));
        }
        changed
    }

    /// Replace the membership of a service wholesale.
    ///
    /// Endpoints that were already tracked keep their health mark.
    pub fn replace(&self, service: &ServiceName, instances: Vec<Instance>) {
        let mut services = self.services.lock().expect("discovery lock");
        let previous = services.remove(service).unwrap_or_default();

        let mut next: Vec<TrackedInstance> = Vec::with_capacity(instances.len());
        for instance in instances {
            if &instance.service != service {
                warn!(
                    service = %service,
                    endpoint = %instance.endpoint(),
                    found = %instance.service,
                    "dropping instance listed under another service"
                );
                continue;
            }
            let endpoint = instance.endpoint();
            if next.iter().any(|t| t.instance.endpoint() == endpoint) {
                continue;
            }
            let healthy = previous
                .iter()
                .find(|t| t.instance.endpoint() == endpoint)
                .map(|t| t.healthy)
                .unwrap_or(true);
            next.push(TrackedInstance { instance, healthy });
        }

        self.publish(service, &next);
        services.insert(service.clone(), next);
    }

    /// Everything tracked for a service, healthy or not.
    pub fn tracked(&self, service: &ServiceName) -> Vec<TrackedInstance> {
        let services = self.services.lock().expect("discovery lock");
        services.get(service).cloned().unwrap_or_default()
    }

    /// Every service the coalescer has seen, sorted.
    pub fn tracked_services(&self) -> Vec<ServiceName> {
        let services = self.services.lock().expect("discovery lock");
        let mut names: Vec<ServiceName> = services.keys().cloned().collect();
        names.sort();
        names
    }

    fn publish(&self, service: &ServiceName, tracked: &[TrackedInstance]) {
        let live: Vec<Instance> = tracked
            .iter()
            .filter(|t| t.healthy)
            .map(|t| t.instance.clone())
            .collect();

        match InstanceSet::new(service.clone(), live) {
            Ok(set) => self.listener.on_instance_set_changed(set),
            Err(e) => warn!(service = %service, error = %e, "refusing to publish invalid instance set"),
        }
    }
}

fn find_mut<'a>(
    services: &'a mut HashMap<ServiceName, Vec<TrackedInstance>>,
    service: &ServiceName,
    endpoint: &str,
) -> Option<&'a mut TrackedInstance> {
    services
        .get_mut(service)?
        .iter_mut()
        .find(|t| t.instance.endpoint() == endpoint)
}

/// Publishes `[[services]]` from configuration through a coalescer.
///
/// Remembers what it published last so that services dropped from the
/// configuration on reload are published as empty sets.
pub struct StaticDiscovery {
    coalescer: Arc<DiscoveryCoalescer>,
    published: Mutex<BTreeSet<ServiceName>>,
}

impl StaticDiscovery {
    pub fn new(coalescer: Arc<DiscoveryCoalescer>) -> Self {
        Self {
            coalescer,
            published: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn publish(&self, services: Vec<(ServiceName, Vec<Instance>)>) {
        let mut published = self.published.lock().expect("static discovery lock");
        let next: BTreeSet<ServiceName> = services.iter().map(|(name, _)| name.clone()).collect();

        for stale in published.difference(&next) {
            debug!(service = %stale, "service dropped from static configuration");
            self.coalescer.replace(stale, Vec::new());
        }
        for (name, instances) in services {
            self.coalescer.replace(&name, instances);
        }

        info!(services = next.len(), "static discovery published");
        *published = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstanceRegistry;

    fn svc(name: &str) -> ServiceName {
        ServiceName::new(name).unwrap()
    }

    fn inst(service: &str, host: &str) -> Instance {
        Instance::new(svc(service), host, 8080)
    }

    /// Records every published set, in order.
    #[derive(Default)]
    struct Recorder {
        sets: Mutex<Vec<InstanceSet>>,
    }

    impl InstanceSetListener for Recorder {
        fn on_instance_set_changed(&self, set: InstanceSet) {
            self.sets.lock().unwrap().push(set);
        }
    }

    impl Recorder {
        fn endpoints(&self) -> Vec<Vec<String>> {
            self.sets
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.iter().map(|i| i.endpoint()).collect())
                .collect()
        }
    }

    #[test]
    fn registrations_publish_full_sets() {
        let recorder = Arc::new(Recorder::default());
        let coalescer = DiscoveryCoalescer::new(recorder.clone());

        assert!(coalescer.apply(DiscoveryEvent::Registered(inst("api", "10.0.0.1"))));
        assert!(coalescer.apply(DiscoveryEvent::Registered(inst("api", "10.0.0.2"))));
        // Identical re-registration is not a change.
        assert!(!coalescer.apply(DiscoveryEvent::Registered(inst("api", "10.0.0.2"))));

        assert_eq!(
            recorder.endpoints(),
            vec![
                vec!["10.0.0.1:8080".to_string()],
                vec!["10.0.0.1:8080".to_string(), "10.0.0.2:8080".to_string()],
            ]
        );
    }

    #[test]
    fn deregistration_publishes_remaining() {
        let recorder = Arc::new(Recorder::default());
        let coalescer = DiscoveryCoalescer::new(recorder.clone());
        coalescer.replace(&svc("api"), vec![inst("api", "10.0.0.1"), inst("api", "10.0.0.2")]);

        assert!(coalescer.apply(DiscoveryEvent::Deregistered {
            service: svc("api"),
            endpoint: "10.0.0.1:8080".to_string(),
        }));
        assert!(!coalescer.apply(DiscoveryEvent::Deregistered {
            service: svc("api"),
            endpoint: "10.0.0.9:8080".to_string(),
        }));

        assert_eq!(recorder.endpoints().last().unwrap(), &vec!["10.0.0.2:8080".to_string()]);
    }

    #[test]
    fn heartbeat_updates_weight_and_metadata() {
        let registry = Arc::new(InstanceRegistry::new());
        let coalescer = DiscoveryCoalescer::new(registry.clone());
        coalescer.apply(DiscoveryEvent::Registered(inst("api", "10.0.0.1")));

        let mut metadata = BTreeMap::new();
        metadata.insert("version".to_string(), "2".to_string());
        assert!(coalescer.apply(DiscoveryEvent::Updated {
            service: svc("api"),
            endpoint: "10.0.0.1:8080".to_string(),
            weight: Some(5),
            metadata: Some(metadata),
        }));

        let set = registry.get_instances(&svc("api"));
        let instance = set.get("10.0.0.1:8080").unwrap();
        assert_eq!(instance.weight, 5);
        assert_eq!(instance.metadata.get("version").map(String::as_str), Some("2"));
    }

    #[test]
    fn unhealthy_instances_are_tracked_but_not_published() {
        let registry = Arc::new(InstanceRegistry::new());
        let coalescer = DiscoveryCoalescer::new(registry.clone());
        coalescer.replace(&svc("api"), vec![inst("api", "10.0.0.1"), inst("api", "10.0.0.2")]);

        coalescer.apply(DiscoveryEvent::HealthChanged {
            service: svc("api"),
            endpoint: "10.0.0.1:8080".to_string(),
            healthy: false,
        });

        assert_eq!(registry.get_instances(&svc("api")).len(), 1);
        assert_eq!(coalescer.tracked(&svc("api")).len(), 2);

        // Health marks survive a full-set replacement.
        coalescer.replace(&svc("api"), vec![inst("api", "10.0.0.1"), inst("api", "10.0.0.3")]);
        let set = registry.get_instances(&svc("api"));
        assert_eq!(set.len(), 1);
        assert!(set.get("10.0.0.3:8080").is_some());

        coalescer.apply(DiscoveryEvent::HealthChanged {
            service: svc("api"),
            endpoint: "10.0.0.1:8080".to_string(),
            healthy: true,
        });
        assert_eq!(registry.get_instances(&svc("api")).len(), 2);
    }

    #[test]
    fn replace_drops_foreign_instances() {
        let registry = Arc::new(InstanceRegistry::new());
        let coalescer = DiscoveryCoalescer::new(registry.clone());
        coalescer.replace(&svc("api"), vec![inst("api", "10.0.0.1"), inst("web", "10.0.0.2")]);
        assert_eq!(registry.get_instances(&svc("api")).len(), 1);
    }

    #[test]
    fn static_discovery_empties_dropped_services() {
        let registry = Arc::new(InstanceRegistry::new());
        let coalescer = Arc::new(DiscoveryCoalescer::new(registry.clone()));
        let static_discovery = StaticDiscovery::new(coalescer.clone());

        static_discovery.publish(vec![
            (svc("api"), vec![inst("api", "10.0.0.1")]),
            (svc("web"), vec![inst("web", "10.0.0.2")]),
        ]);
        assert_eq!(registry.get_instances(&svc("web")).len(), 1);

        static_discovery.publish(vec![(svc("api"), vec![inst("api", "10.0.0.1")])]);
        assert!(registry.get_instances(&svc("web")).is_empty());
        assert!(registry.contains(&svc("web")));
        assert_eq!(coalescer.tracked_services(), vec![svc("api"), svc("web")]);
    }
}
