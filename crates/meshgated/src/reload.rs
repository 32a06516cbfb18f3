//! Configuration loading and hot reload.
//!
//! A reload compiles the whole document before touching anything live.
//! If any route, policy, or static service is invalid the running
//! routes and instance sets stay exactly as they were.
//!
//! Only `[[routes]]`, `[defaults]` and `[[services]]` are reloadable.
//! `[server]` and `[health]` are read once at startup.

use std::future::pending;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use meshgate_core::{ConfigError, GatewayConfig};
use meshgate_registry::{DiscoveryCoalescer, InstanceRegistry, StaticDiscovery};
use meshgate_routing::{RouteTable, SharedRouteTable};

/// Owns the path to `gateway.toml` and everything a reload replaces.
pub struct ConfigReloader {
    path: PathBuf,
    routes: Arc<SharedRouteTable>,
    registry: Arc<InstanceRegistry>,
    static_discovery: StaticDiscovery,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigReloader {
    pub fn new(
        path: impl Into<PathBuf>,
        routes: Arc<SharedRouteTable>,
        registry: Arc<InstanceRegistry>,
        coalescer: Arc<DiscoveryCoalescer>,
    ) -> Self {
        Self {
            path: path.into(),
            routes,
            registry,
            static_discovery: StaticDiscovery::new(coalescer),
            last_modified: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file and apply it. Returns the parsed document so the
    /// caller can pick up startup-only sections.
    pub fn load(&self) -> Result<GatewayConfig, ConfigError> {
        let modified = modified_time(&self.path);
        let config = GatewayConfig::from_file(&self.path)?;
        self.apply(&config)?;
        *self.last_modified.lock().expect("reload lock") = modified;
        Ok(config)
    }

    /// Install routes and static services from `config`, all or nothing.
    /// Returns the number of routes installed.
    pub fn apply(&self, config: &GatewayConfig) -> Result<usize, ConfigError> {
        let table = RouteTable::from_config(config)?;
        let services = config.static_services()?;
        if let Some(health) = &config.health {
            health.validate()?;
        }

        self.static_discovery.publish(services);
        for service in table.target_services() {
            self.registry.declare(&service);
        }

        let count = table.len();
        self.routes.replace(table);
        Ok(count)
    }

    /// Reload from disk, logging the outcome. A rejected document leaves
    /// the running configuration in place.
    pub fn reload(&self, trigger: &str) -> Result<usize, ConfigError> {
        match self.load() {
            Ok(_) => {
                let routes = self.routes.load().len();
                info!(path = %self.path.display(), trigger, routes, "configuration reloaded");
                Ok(routes)
            }
            Err(e) => {
                error!(path = %self.path.display(), trigger, error = %e, "configuration rejected, keeping previous");
                Err(e)
            }
        }
    }

    /// Reload only if the file's modification time moved since the last
    /// successful load. Returns whether a reload was attempted.
    pub fn reload_if_changed(&self) -> bool {
        let current = modified_time(&self.path);
        let last = *self.last_modified.lock().expect("reload lock");
        if current.is_none() || current == last {
            return false;
        }
        // A rejected file is not retried until it changes again.
        if self.reload("file_changed").is_err() {
            *self.last_modified.lock().expect("reload lock") = current;
        }
        true
    }

    /// Reload on SIGHUP, and on file change every `poll` when given,
    /// until shutdown.
    pub async fn run(&self, poll: Option<Duration>, mut shutdown: watch::Receiver<bool>) {
        let mut hangup = hangup_signal();
        let mut ticker = poll.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(
            path = %self.path.display(),
            poll_secs = poll.map(|p| p.as_secs()),
            "config reload task started"
        );

        loop {
            tokio::select! {
                _ = next_hangup(&mut hangup) => {
                    let _ = self.reload("sighup");
                }
                _ = next_tick(&mut ticker) => {
                    if !self.reload_if_changed() {
                        debug!("configuration unchanged");
                    }
                }
                _ = shutdown.changed() => {
                    info!("config reload task shutting down");
                    break;
                }
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(unix)]
type Hangup = tokio::signal::unix::Signal;

#[cfg(not(unix))]
type Hangup = ();

#[cfg(unix)]
fn hangup_signal() -> Option<Hangup> {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::hangup()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(error = %e, "SIGHUP reload unavailable");
            None
        }
    }
}

#[cfg(not(unix))]
fn hangup_signal() -> Option<Hangup> {
    None
}

#[cfg(unix)]
async fn next_hangup(hangup: &mut Option<Hangup>) {
    match hangup {
        Some(signal) => {
            if signal.recv().await.is_none() {
                pending::<()>().await;
            }
        }
        None => pending().await,
    }
}

#[cfg(not(unix))]
async fn next_hangup(_hangup: &mut Option<Hangup>) {
    pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_core::ServiceName;

    fn reloader(path: &Path) -> (ConfigReloader, Arc<SharedRouteTable>, Arc<InstanceRegistry>) {
        let routes = Arc::new(SharedRouteTable::default());
        let registry = Arc::new(InstanceRegistry::new());
        let coalescer = Arc::new(DiscoveryCoalescer::new(registry.clone()));
        let reloader = ConfigReloader::new(path, routes.clone(), registry.clone(), coalescer);
        (reloader, routes, registry)
    }

    #[test]
    fn apply_declares_every_target_service() {
        let dir = tempfile::tempdir().unwrap();
        let (reloader, routes, registry) = reloader(&dir.path().join("gateway.toml"));

        let config = GatewayConfig::from_toml_str(
            r#"
[[routes]]
id = "orders"
path = "/orders/**"
service = "orders"
"#,
        )
        .unwrap();

        assert_eq!(reloader.apply(&config).unwrap(), 1);
        assert_eq!(routes.load().len(), 1);
        let orders = ServiceName::new("orders").unwrap();
        assert!(registry.contains(&orders));
        assert!(registry.get_instances(&orders).is_empty());
    }

    #[test]
    fn invalid_health_section_rejects_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let (reloader, routes, registry) = reloader(&dir.path().join("gateway.toml"));

        let config = GatewayConfig::from_toml_str(
            r#"
[[routes]]
id = "orders"
path = "/orders/**"
service = "orders"

[health]
interval = "0s"
"#,
        )
        .unwrap();

        let err = reloader.apply(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPolicy { .. }), "{err}");
        assert!(routes.load().is_empty());
        assert!(!registry.contains(&ServiceName::new("orders").unwrap()));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let (reloader, routes, _) = reloader(&dir.path().join("absent.toml"));

        assert!(matches!(reloader.load(), Err(ConfigError::Read { .. })));
        assert!(routes.load().is_empty());
        assert!(!reloader.reload_if_changed());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (reloader, _, _) = reloader(&dir.path().join("gateway.toml"));
        let reloader = Arc::new(reloader);

        let (tx, rx) = watch::channel(false);
        let task = {
            let reloader = reloader.clone();
            tokio::spawn(async move { reloader.run(Some(Duration::from_millis(10)), rx).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
