//! `meshgated check` output.

use meshgate_routing::{HostPattern, RouteRule, RouteTable};

/// One line per rule, in evaluation order.
pub fn describe_routes(table: &RouteTable) -> Vec<String> {
    table
        .rules()
        .iter()
        .enumerate()
        .map(|(i, rule)| format!("{:>3}. {}", i + 1, describe_rule(rule)))
        .collect()
}

fn describe_rule(rule: &RouteRule) -> String {
    let predicate = &rule.predicate;
    let methods = if predicate.methods.is_empty() {
        "*".to_string()
    } else {
        predicate
            .methods
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(",")
    };
    let hosts = if predicate.hosts.is_empty() {
        "*".to_string()
    } else {
        predicate
            .hosts
            .iter()
            .map(|h| match h {
                HostPattern::Exact(host) => host.clone(),
                HostPattern::Wildcard(suffix) => format!("*{suffix}"),
            })
            .collect::<Vec<_>>()
            .join(",")
    };

    let policy = &rule.policy;
    let mut line = format!(
        "{} {} host={} -> {} [{}] timeout={:?} attempts={} breaker={}/{:?}",
        rule.id,
        predicate.path.as_str(),
        hosts,
        rule.service,
        policy.lb,
        policy.timeout,
        policy.retry.max_attempts(),
        policy.breaker.failure_threshold,
        policy.breaker.window,
    );
    line.push_str(&format!(" methods={methods}"));
    if rule.strip_prefix > 0 {
        line.push_str(&format!(" strip_prefix={}", rule.strip_prefix));
    }
    line
}
