//! Per-request context and header rewriting.

use std::net::SocketAddr;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::Method;

use meshgate_resilience::Deadline;
use meshgate_routing::RouteRule;

/// Headers that describe one connection and never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Host the caller addressed, from `Host` or the absolute-form URI.
pub fn request_host(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
}

/// Everything an attempt needs to rebuild the outbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Upstream path and query, after prefix stripping.
    pub path_and_query: String,
    /// Outbound headers without `Host`; the forwarder sets it per instance.
    pub headers: HeaderMap,
    pub deadline: Deadline,
}

impl RequestContext {
    pub fn new(
        parts: &Parts,
        rule: &RouteRule,
        host: Option<&str>,
        peer: Option<SocketAddr>,
        deadline: Deadline,
    ) -> Self {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        if let Some(peer) = peer {
            let ip = peer.ip().to_string();
            let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) if !existing.trim().is_empty() => format!("{existing}, {ip}"),
                _ => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
        if !headers.contains_key(&X_FORWARDED_HOST) {
            if let Some(value) = host.and_then(|h| HeaderValue::from_str(h).ok()) {
                headers.insert(X_FORWARDED_HOST, value);
            }
        }
        if !headers.contains_key(&X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }

        Self {
            method: parts.method.clone(),
            path_and_query: rule.upstream_path(path_and_query),
            headers,
            deadline,
        }
    }
}
