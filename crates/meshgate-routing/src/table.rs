//! Route table — ordered rule list, resolved once per request.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::Method;
use thiserror::Error;
use tracing::{debug, info};

use meshgate_core::{ConfigError, GatewayConfig, ServiceName};

use crate::rule::RouteRule;

/// No rule matched the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no route matches {method} {path}")]
pub struct RouteNotFound {
    pub method: Method,
    pub path: String,
}

/// Immutable, ordered rule list. First match wins.
#[derive(Debug, Default)]
pub struct RouteTable {
    rules: Vec<Arc<RouteRule>>,
}

impl RouteTable {
    /// Build a table, rejecting duplicate route ids.
    pub fn new(rules: Vec<RouteRule>) -> Result<Self, ConfigError> {
        let mut ids = HashSet::new();
        for rule in &rules {
            if !ids.insert(rule.id.clone()) {
                return Err(ConfigError::DuplicateRoute(rule.id.clone()));
            }
        }
        Ok(Self {
            rules: rules.into_iter().map(Arc::new).collect(),
        })
    }

    /// Compile every `[[routes]]` entry. Any error rejects the whole table.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        config.default_policy().validate("defaults")?;

        let rules = config
            .routes
            .iter()
            .map(|route| RouteRule::compile(route, config.route_policy(route)))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(rules)
    }

    /// Return the first rule, in configured order, whose predicate matches.
    ///
    /// `path` must not include the query string.
    pub fn resolve(
        &self,
        method: &Method,
        path: &str,
        host: Option<&str>,
    ) -> Result<Arc<RouteRule>, RouteNotFound> {
        match self.rules.iter().find(|r| r.predicate.matches(method, path, host)) {
            Some(rule) => {
                debug!(route = %rule.id, service = %rule.service, %method, path, "route resolved");
                Ok(rule.clone())
            }
            None => {
                debug!(%method, path, host, "no route matched");
                Err(RouteNotFound {
                    method: method.clone(),
                    path: path.to_string(),
                })
            }
        }
    }

    pub fn rules(&self) -> &[Arc<RouteRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every service some rule routes to.
    pub fn target_services(&self) -> BTreeSet<ServiceName> {
        self.rules.iter().map(|r| r.service.clone()).collect()
    }
}

/// Handle to the live route table, replaced wholesale on reload.
pub struct SharedRouteTable {
    current: ArcSwap<RouteTable>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// The table in effect right now.
    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    pub fn replace(&self, table: RouteTable) {
        let count = table.len();
        self.current.store(Arc::new(table));
        info!(routes = count, "route table installed");
    }
}

impl Default for SharedRouteTable {
    fn default() -> Self {
        Self::new(RouteTable::default())
    }
}
