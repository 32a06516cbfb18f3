//! Path and host patterns.
//!
//! Paths match segment by segment, so `/api/**` matches `/api` and
//! `/api/users` but never `/apikeys`. Hosts match exactly or through a
//! single-label wildcard (`*.example.com`), ignoring case and port.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment.
    Any,
}

/// A compiled path pattern such as `/api/users/*/orders/**`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
    /// Pattern ends in `/**`: zero or more trailing segments.
    open_ended: bool,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if !raw.starts_with('/') {
            return Err(format!("path pattern must start with '/': {raw:?}"));
        }

        let parts: Vec<&str> = split_segments(raw).collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut open_ended = false;

        for (i, part) in parts.iter().enumerate() {
            match *part {
                "**" if i + 1 == parts.len() => open_ended = true,
                "**" => return Err(format!("'**' is only allowed as the last segment: {raw:?}")),
                "*" => segments.push(Segment::Any),
                p if p.contains('*') => {
                    return Err(format!("wildcards must span a whole segment: {raw:?}"));
                }
                p => segments.push(Segment::Literal(p.to_string())),
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            open_ended,
        })
    }

    /// Match a request path (without query string).
    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split_segments(path);

        for segment in &self.segments {
            match (segment, parts.next()) {
                (_, None) => return false,
                (Segment::Any, Some(_)) => {}
                (Segment::Literal(lit), Some(part)) if lit == part => {}
                _ => return false,
            }
        }

        self.open_ended || parts.next().is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub(crate) fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// A host pattern: `api.example.com` or `*.example.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Exact(String),
    /// Stores the suffix including the leading dot (".example.com").
    Wildcard(String),
}

impl HostPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let pattern = raw.trim().to_ascii_lowercase();
        if pattern.is_empty() {
            return Err("host pattern must not be empty".to_string());
        }

        if let Some(suffix) = pattern.strip_prefix('*') {
            if !suffix.starts_with('.') || suffix.len() < 2 || suffix.contains('*') {
                return Err(format!("invalid wildcard host pattern: {raw:?}"));
            }
            return Ok(HostPattern::Wildcard(suffix.to_string()));
        }
        if pattern.contains('*') {
            return Err(format!("wildcard must be the leftmost label: {raw:?}"));
        }

        Ok(HostPattern::Exact(pattern))
    }

    /// `*.example.com` matches `foo.example.com`, but neither
    /// `example.com` nor `foo.bar.example.com`.
    pub fn matches(&self, host: &str) -> bool {
        let host = normalize_host(host);
        match self {
            HostPattern::Exact(exact) => host == *exact,
            HostPattern::Wildcard(suffix) => match host.strip_suffix(suffix.as_str()) {
                Some(prefix) => !prefix.is_empty() && !prefix.contains('.'),
                None => false,
            },
        }
    }
}

/// Lowercase and strip any port (IPv6 literals keep their brackets).
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    };
    without_port.to_ascii_lowercase()
}
