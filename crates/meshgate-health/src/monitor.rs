//! Health monitor — background probing for every tracked instance.
//!
//! The monitor periodically reconciles its probe tasks with the
//! instances the discovery coalescer tracks: new instances get a task,
//! departed ones have theirs stopped. Each task probes its instance and
//! reports verdict changes back to the coalescer as `HealthChanged`
//! events, which republishes the service's instance set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use meshgate_core::config::HealthCheckConfig;
use meshgate_core::{Instance, ServiceName};
use meshgate_registry::{DiscoveryCoalescer, DiscoveryEvent};

use crate::checker::{HealthStatus, HealthTracker, http_probe};

type ProbeKey = (ServiceName, String);

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Runs one probe loop per tracked instance.
pub struct HealthMonitor {
    coalescer: Arc<DiscoveryCoalescer>,
    config: HealthCheckConfig,
    monitors: RwLock<HashMap<ProbeKey, MonitorSlot>>,
}

impl HealthMonitor {
    pub fn new(coalescer: Arc<DiscoveryCoalescer>, config: HealthCheckConfig) -> Self {
        Self {
            coalescer,
            config,
            monitors: RwLock::new(HashMap::new()),
        }
    }

    /// Start probes for newly tracked instances and stop probes for
    /// instances that are gone.
    pub async fn sync(&self) {
        let mut wanted: HashMap<ProbeKey, Instance> = HashMap::new();
        for service in self.coalescer.tracked_services() {
            for tracked in self.coalescer.tracked(&service) {
                wanted.insert((service.clone(), tracked.instance.endpoint()), tracked.instance);
            }
        }

        let mut monitors = self.monitors.write().await;

        let stale: Vec<ProbeKey> = monitors
            .keys()
            .filter(|key| !wanted.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(slot) = monitors.remove(&key) {
                let _ = slot.shutdown_tx.send(true);
                slot.handle.abort();
                debug!(service = %key.0, endpoint = %key.1, "health probe stopped");
            }
        }

        let started: HashSet<ProbeKey> = monitors.keys().cloned().collect();
        for (key, instance) in wanted {
            if started.contains(&key) {
                continue;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(run_probe_loop(
                instance,
                self.config.clone(),
                self.coalescer.clone(),
                shutdown_rx,
            ));
            debug!(service = %key.0, endpoint = %key.1, "health probe started");
            monitors.insert(key, MonitorSlot { handle, shutdown_tx });
        }
    }

    /// Reconcile on every check interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            path = %self.config.path,
            interval_ms = self.config.interval.as_millis() as u64,
            "health monitor started"
        );
        loop {
            self.sync().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.stop_all().await;
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (_, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
        info!("health monitor stopped");
    }

    pub async fn active_probes(&self) -> usize {
        self.monitors.read().await.len()
    }
}

async fn run_probe_loop(
    instance: Instance,
    config: HealthCheckConfig,
    coalescer: Arc<DiscoveryCoalescer>,
    mut shutdown: watch::Receiver<bool>,
) {
    let endpoint = instance.endpoint();
    let mut tracker = HealthTracker::new(&config);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(tracker.next_interval()) => {
                let result = http_probe(&endpoint, &config.path, config.timeout).await;
                let previous = tracker.status();
                let current = tracker.record(result);

                if current != previous && current != HealthStatus::Unknown {
                    coalescer.apply(DiscoveryEvent::HealthChanged {
                        service: instance.service.clone(),
                        endpoint: endpoint.clone(),
                        healthy: current == HealthStatus::Healthy,
                    });
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
