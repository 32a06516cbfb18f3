//! gateway.toml configuration parser.
//!
//! Parsing only checks shape. Semantic checks (patterns, policy bounds,
//! duplicate ids) happen when routes are compiled, so a bad document is
//! rejected as a whole.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::error::ConfigError;
use crate::policy::{
    BreakerPolicy, BreakerScope, LbStrategy, MAX_POLICY_DURATION, RetryCondition, RetryPolicy, RoutePolicy,
};
use crate::types::{Instance, ServiceName};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub defaults: PolicyOverrides,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub services: Vec<StaticServiceConfig>,
    pub health: Option<HealthCheckConfig>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_replayable_body() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Address for the discovery push API. Disabled when absent.
    pub discovery_listen: Option<SocketAddr>,
    /// Request bodies up to this size are buffered so they can be retried.
    #[serde(default = "default_max_replayable_body")]
    pub max_replayable_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            discovery_listen: None,
            max_replayable_body_bytes: default_max_replayable_body(),
        }
    }
}

/// Optional overrides layered on top of a base `RoutePolicy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default, with = "duration::optional", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "duration::optional", skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb: Option<LbStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOverrides>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryOverrides {
    pub max_retries: Option<u32>,
    #[serde(default, with = "duration::optional")]
    pub min_retry_window: Option<Duration>,
    pub retry_on: Option<Vec<RetryCondition>>,
    pub retry_non_idempotent: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerOverrides {
    pub failure_threshold: Option<u32>,
    #[serde(default, with = "duration::optional")]
    pub window: Option<Duration>,
    #[serde(default, with = "duration::optional")]
    pub cool_down: Option<Duration>,
    pub scope: Option<BreakerScope>,
}

impl PolicyOverrides {
    /// Layer these overrides on top of `base`.
    pub fn apply(&self, base: &RoutePolicy) -> RoutePolicy {
        let mut policy = base.clone();

        if let Some(timeout) = self.timeout {
            policy.timeout = timeout;
        }
        if let Some(per_try) = self.per_try_timeout {
            policy.per_try_timeout = Some(per_try);
        }
        if let Some(lb) = self.lb {
            policy.lb = lb;
        }
        if let Some(retry) = &self.retry {
            policy.retry = retry.apply(&policy.retry);
        }
        if let Some(breaker) = &self.breaker {
            policy.breaker = breaker.apply(&policy.breaker);
        }

        policy
    }
}

impl RetryOverrides {
    fn apply(&self, base: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            min_retry_window: self.min_retry_window.unwrap_or(base.min_retry_window),
            retry_on: self.retry_on.clone().unwrap_or_else(|| base.retry_on.clone()),
            retry_non_idempotent: self.retry_non_idempotent.unwrap_or(base.retry_non_idempotent),
        }
    }
}

impl BreakerOverrides {
    fn apply(&self, base: &BreakerPolicy) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            window: self.window.unwrap_or(base.window),
            cool_down: self.cool_down.unwrap_or(base.cool_down),
            scope: self.scope.unwrap_or(base.scope),
        }
    }
}

/// One `[[routes]]` entry, as written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    /// Path pattern: literal segments, `*` for one segment, trailing `/**`.
    pub path: String,
    /// Host patterns; empty matches any host.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Allowed methods; empty matches any method.
    #[serde(default)]
    pub methods: Vec<String>,
    pub service: String,
    /// Leading path segments removed before forwarding.
    #[serde(default)]
    pub strip_prefix: u32,
    #[serde(flatten)]
    pub policy: PolicyOverrides,
}

/// One `[[services]]` entry for static discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticServiceConfig {
    pub name: String,
    #[serde(default)]
    pub instances: Vec<StaticInstanceConfig>,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticInstanceConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    1
}

/// `[health]`: active probing of discovered instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_interval", with = "duration::required")]
    pub interval: Duration,
    #[serde(default = "default_health_timeout", with = "duration::required")]
    pub timeout: Duration,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

impl HealthCheckConfig {
    /// Reject settings the health monitor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPolicy {
            scope: "health".to_string(),
            reason: reason.to_string(),
        };

        if !self.path.starts_with('/') {
            return Err(invalid("path must start with '/'"));
        }
        if self.interval.is_zero() || self.interval > MAX_POLICY_DURATION {
            return Err(invalid("interval must be greater than zero and at most 24h"));
        }
        if self.timeout.is_zero() || self.timeout > MAX_POLICY_DURATION {
            return Err(invalid("timeout must be greater than zero and at most 24h"));
        }
        if self.unhealthy_threshold == 0 || self.healthy_threshold == 0 {
            return Err(invalid("thresholds must be at least 1"));
        }
        Ok(())
    }
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Base policy every route starts from: built-in defaults plus `[defaults]`.
    pub fn default_policy(&self) -> RoutePolicy {
        self.defaults.apply(&RoutePolicy::default())
    }

    /// Effective policy for one route.
    pub fn route_policy(&self, route: &RouteConfig) -> RoutePolicy {
        route.policy.apply(&self.default_policy())
    }

    /// Convert `[[services]]` into per-service instance lists.
    ///
    /// Fails on empty names, empty hosts, or a service listed twice.
    pub fn static_services(&self) -> Result<Vec<(ServiceName, Vec<Instance>)>, ConfigError> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.services.len());

        for entry in &self.services {
            let name = ServiceName::new(&entry.name).map_err(|e| ConfigError::InvalidService {
                name: entry.name.clone(),
                reason: e.to_string(),
            })?;
            if !seen.insert(name.clone()) {
                return Err(ConfigError::InvalidService {
                    name: entry.name.clone(),
                    reason: "listed more than once".to_string(),
                });
            }

            let mut instances = Vec::with_capacity(entry.instances.len());
            for inst in &entry.instances {
                if inst.host.trim().is_empty() {
                    return Err(ConfigError::InvalidService {
                        name: entry.name.clone(),
                        reason: "instance host must not be empty".to_string(),
                    });
                }
                instances.push(Instance {
                    service: name.clone(),
                    host: inst.host.clone(),
                    port: inst.port,
                    weight: inst.weight,
                    metadata: inst.metadata.clone(),
                });
            }
            out.push((name, instances));
        }

        Ok(out)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
