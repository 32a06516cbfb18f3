//! Route rules — predicate, target service, and policy.

use http::Method;

use meshgate_core::config::RouteConfig;
use meshgate_core::{ConfigError, RoutePolicy, ServiceName};

use crate::pattern::{split_segments, HostPattern, PathPattern};

/// What a request must look like for a rule to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePredicate {
    pub path: PathPattern,
    /// Empty means any host.
    pub hosts: Vec<HostPattern>,
    /// Empty means any method.
    pub methods: Vec<Method>,
}

impl RoutePredicate {
    pub fn matches(&self, method: &Method, path: &str, host: Option<&str>) -> bool {
        if !self.methods.is_empty() && !self.methods.contains(method) {
            return false;
        }
        if !self.hosts.is_empty() {
            match host {
                Some(host) if self.hosts.iter().any(|h| h.matches(host)) => {}
                _ => return false,
            }
        }
        self.path.matches(path)
    }
}

/// A compiled `[[routes]]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub id: String,
    pub predicate: RoutePredicate,
    pub service: ServiceName,
    /// Leading path segments removed before forwarding.
    pub strip_prefix: u32,
    pub policy: RoutePolicy,
}

impl RouteRule {
    /// Compile a route entry against an already-resolved policy.
    pub fn compile(route: &RouteConfig, policy: RoutePolicy) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRoute {
            id: route.id.clone(),
            reason,
        };

        if route.id.trim().is_empty() {
            return Err(invalid("route id must not be empty".to_string()));
        }

        let path = PathPattern::parse(&route.path).map_err(&invalid)?;
        let hosts = route
            .hosts
            .iter()
            .map(|h| HostPattern::parse(h))
            .collect::<Result<Vec<_>, _>>()
            .map_err(&invalid)?;
        let methods = route
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                    .map_err(|_| format!("invalid method: {m:?}"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(&invalid)?;
        let service = ServiceName::new(&route.service).map_err(|e| invalid(e.to_string()))?;

        policy.validate(&format!("route {}", route.id))?;

        Ok(Self {
            id: route.id.clone(),
            predicate: RoutePredicate {
                path,
                hosts,
                methods,
            },
            service,
            strip_prefix: route.strip_prefix,
            policy,
        })
    }

    /// Rewrite an inbound path-and-query for the upstream, applying
    /// `strip_prefix`. The query string is carried over untouched.
    pub fn upstream_path(&self, path_and_query: &str) -> String {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let mut rewritten = if self.strip_prefix == 0 {
            if path.is_empty() { "/".to_string() } else { path.to_string() }
        } else {
            let rest: Vec<&str> = split_segments(path).skip(self.strip_prefix as usize).collect();
            let mut out = format!("/{}", rest.join("/"));
            if path.ends_with('/') && !rest.is_empty() {
                out.push('/');
            }
            out
        };

        if let Some(query) = query {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        rewritten
    }
}
