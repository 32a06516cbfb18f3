//! Domain types for services and their backend instances.
//!
//! An `InstanceSet` is the unit of publication: discovery replaces the
//! whole set for a service at once, and readers keep whatever snapshot
//! they already hold.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// ── ServiceName ───────────────────────────────────────────────────

/// Logical name of a backend service.
///
/// Stored lowercased so that comparison and hashing are
/// case-insensitive. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: impl AsRef<str>) -> CoreResult<Self> {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            return Err(CoreError::EmptyServiceName);
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServiceName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

// ── Instance ──────────────────────────────────────────────────────

fn default_weight() -> u32 {
    1
}

/// One running backend process reachable at `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub service: ServiceName,
    pub host: String,
    pub port: u16,
    /// Relative share for weighted selection. Zero means "never, unless
    /// every candidate is zero".
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Instance {
    pub fn new(service: ServiceName, host: impl Into<String>, port: u16) -> Self {
        Self {
            service,
            host: host.into(),
            port,
            weight: default_weight(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// ── InstanceSet ───────────────────────────────────────────────────

/// Immutable snapshot of the live instances of one service.
///
/// There are no mutating methods; an update builds a new set and the
/// registry swaps it in.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSet {
    service: ServiceName,
    instances: Vec<Arc<Instance>>,
}

impl InstanceSet {
    pub fn empty(service: ServiceName) -> Self {
        Self {
            service,
            instances: Vec::new(),
        }
    }

    /// Build a snapshot, rejecting instances of another service.
    ///
    /// Duplicate endpoints keep the first occurrence.
    pub fn new(service: ServiceName, instances: Vec<Instance>) -> CoreResult<Self> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(instances.len());

        for instance in instances {
            if instance.host.trim().is_empty() {
                return Err(CoreError::EmptyHost);
            }
            if instance.service != service {
                return Err(CoreError::ForeignInstance {
                    endpoint: instance.endpoint(),
                    expected: service.to_string(),
                    found: instance.service.to_string(),
                });
            }
            if seen.insert(instance.endpoint()) {
                out.push(Arc::new(instance));
            }
        }

        Ok(Self {
            service,
            instances: out,
        })
    }

    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Find an instance by its `host:port` endpoint.
    pub fn get(&self, endpoint: &str) -> Option<&Arc<Instance>> {
        self.instances.iter().find(|i| i.endpoint() == endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Instance>> {
        self.instances.iter()
    }
}

// ── Circuit breaker state ─────────────────────────────────────────

/// Circuit breaker position for an instance or a whole service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

/// Read-only view of breaker positions, consulted during selection.
///
/// `Open` means "not callable right now". `HalfOpen` means the
/// cool-down has elapsed and a trial call would be admitted.
pub trait BreakerStateView: Send + Sync {
    fn breaker_state(&self, instance: &Instance) -> BreakerState;
}

/// View that reports every instance as closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllClosed;

impl BreakerStateView for AllClosed {
    fn breaker_state(&self, _instance: &Instance) -> BreakerState {
        BreakerState::Closed
    }
}
