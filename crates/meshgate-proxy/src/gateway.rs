//! Gateway orchestrator.
//!
//! Per request: resolve the route, then up to `max_retries + 1` times
//! select an instance, pass its breaker gate, forward, and record the
//! outcome. Every attempt shares one deadline taken at ingress.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, header};
use hyper::body::Body;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use meshgate_balance::{InFlightGuard, LoadBalancer, SelectError, Selection};
use meshgate_core::InstanceSet;
use meshgate_registry::{InstanceRegistry, InstanceSetListener};
use meshgate_resilience::{
    BreakerPermit, BreakerRegistry, BudgetError, Deadline, Disposition, ForwardError, Outcome,
    RetryBudget, classify,
};
use meshgate_routing::{RouteRule, SharedRouteTable};

use crate::body::{BoxError, ProxyBody, RequestBody, TrackedBody, buffer_response};
use crate::context::{RequestContext, request_host};
use crate::error::GatewayError;
use crate::forwarder::{Forwarder, HttpUpstream, Upstream};

pub const DEFAULT_MAX_REPLAYABLE_BODY_BYTES: usize = 64 * 1024;

/// The outcome of the latest attempt that may still be surfaced.
enum Settled {
    /// A retryable upstream response, passed through if no retry happens.
    Response(Response<ProxyBody>),
    Error(GatewayError),
}

impl Settled {
    fn into_result(self) -> Result<Response<ProxyBody>, GatewayError> {
        match self {
            Settled::Response(response) => Ok(response),
            Settled::Error(err) => Err(err),
        }
    }
}

/// Routes, balances, and forwards inbound requests.
pub struct Gateway<U = HttpUpstream> {
    routes: Arc<SharedRouteTable>,
    registry: Arc<InstanceRegistry>,
    balancer: LoadBalancer,
    breakers: Arc<BreakerRegistry>,
    forwarder: Forwarder<U>,
    max_replayable_body_bytes: usize,
}

impl<U: Upstream> Gateway<U> {
    pub fn new(routes: Arc<SharedRouteTable>, registry: Arc<InstanceRegistry>, upstream: U) -> Self {
        Self {
            routes,
            registry,
            balancer: LoadBalancer::new(),
            breakers: Arc::new(BreakerRegistry::new()),
            forwarder: Forwarder::new(upstream),
            max_replayable_body_bytes: DEFAULT_MAX_REPLAYABLE_BODY_BYTES,
        }
    }

    pub fn with_max_replayable_body_bytes(mut self, limit: usize) -> Self {
        self.max_replayable_body_bytes = limit;
        self
    }

    pub fn routes(&self) -> &Arc<SharedRouteTable> {
        &self.routes
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn upstream(&self) -> &U {
        self.forwarder.upstream()
    }

    /// Handle one request, turning failures into error responses.
    pub async fn handle<B>(&self, request: Request<B>, peer: Option<SocketAddr>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        match self.dispatch(request, peer).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    GatewayError::RoutingFailure { .. } | GatewayError::BadRequest => {
                        debug!(kind = err.kind(), error = %err, "request rejected")
                    }
                    _ => warn!(kind = err.kind(), error = %err, "request failed"),
                }
                err.into_response()
            }
        }
    }

    /// Run the pipeline for one request.
    pub async fn dispatch<B>(
        &self,
        request: Request<B>,
        peer: Option<SocketAddr>,
    ) -> Result<Response<ProxyBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();
        let host = request_host(&parts);

        let table = self.routes.load();
        let rule = table.resolve(&parts.method, parts.uri.path(), host.as_deref())?;
        let policy = &rule.policy;
        let deadline = Deadline::after(policy.timeout);

        let content_length = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let prepare = RequestBody::prepare(body, content_length, self.max_replayable_body_bytes);
        let mut body = match tokio::time::timeout_at(deadline.at(), prepare).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                debug!(error = %e, "request body could not be buffered");
                return Err(GatewayError::BadRequest);
            }
            Err(_) => return Err(GatewayError::DeadlineExceeded),
        };

        let ctx = RequestContext::new(&parts, &rule, host.as_deref(), peer, deadline);
        let mut budget = RetryBudget::from_policy(&policy.retry);
        let mut excluded = HashSet::new();
        let mut last: Option<Settled> = None;

        loop {
            let window = match budget.begin_attempt(&deadline, policy.per_try_timeout) {
                Ok(window) => window,
                Err(BudgetError::Exhausted { attempts }) => {
                    debug!(route = %rule.id, attempts, "retry budget exhausted");
                    return conclude(last, GatewayError::DeadlineExceeded);
                }
                Err(e) => {
                    info!(route = %rule.id, error = %e, "retry skipped, not enough time left");
                    return pass_through_or(last, GatewayError::DeadlineExceeded);
                }
            };

            let (selection, permit) = match self.select_and_gate(&rule, &mut excluded) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(route = %rule.id, error = %e, "no instance to try");
                    return conclude(last, e.into());
                }
            };
            let Some(upstream_body) = body.take() else {
                return conclude(last, GatewayError::BadRequest);
            };

            let endpoint = selection.instance.endpoint();
            debug!(
                route = %rule.id,
                service = %rule.service,
                %endpoint,
                attempt = window.attempt,
                breaker = %selection.breaker_state,
                trial = permit.is_trial(),
                "forwarding"
            );

            let started = Instant::now();
            let result = self
                .forwarder
                .forward(&selection.instance, &ctx, upstream_body, window.timeout)
                .await;
            let latency_ms = started.elapsed().as_millis() as u64;
            excluded.insert(endpoint.clone());

            match result {
                Ok(response) => {
                    let status = response.status();
                    permit.record(if status.is_server_error() {
                        Outcome::Failure
                    } else {
                        Outcome::Success
                    });

                    let retry = !budget.is_last_attempt()
                        && body.is_replayable()
                        && classify(&policy.retry, &ctx.method, &ForwardError::Status(status.as_u16()))
                            == Disposition::Retry;
                    if retry {
                        info!(
                            route = %rule.id,
                            service = %rule.service,
                            %endpoint,
                            status = status.as_u16(),
                            attempt = window.attempt,
                            latency_ms,
                            "retrying after upstream status"
                        );
                        let held = buffer_response(response, self.max_replayable_body_bytes, deadline.at()).await;
                        last = Some(Settled::Response(held));
                        continue;
                    }

                    info!(
                        route = %rule.id,
                        service = %rule.service,
                        %endpoint,
                        status = status.as_u16(),
                        attempt = window.attempt,
                        latency_ms,
                        "upstream responded"
                    );
                    return Ok(track(response, selection.guard, &deadline));
                }
                Err(ForwardError::Timeout(_)) if window.bounded_by_deadline => {
                    // Out of time: the backend is not to blame.
                    drop(permit);
                    warn!(
                        route = %rule.id,
                        service = %rule.service,
                        attempt = window.attempt,
                        latency_ms,
                        "deadline reached during attempt"
                    );
                    return pass_through_or(last, GatewayError::DeadlineExceeded);
                }
                Err(error) => {
                    permit.record(if error.counts_against_breaker() {
                        Outcome::Failure
                    } else {
                        Outcome::Success
                    });
                    warn!(
                        route = %rule.id,
                        service = %rule.service,
                        %endpoint,
                        attempt = window.attempt,
                        latency_ms,
                        kind = error.kind(),
                        error = %error,
                        "upstream attempt failed"
                    );

                    let retryable = body.is_replayable()
                        && classify(&policy.retry, &ctx.method, &error) == Disposition::Retry;
                    let failure = GatewayError::Upstream {
                        service: rule.service.clone(),
                        attempts: window.attempt,
                        error,
                    };
                    if !retryable {
                        return Err(failure);
                    }
                    last = Some(Settled::Error(failure));
                }
            }
        }
    }

    /// Select an instance and pass its breaker. An instance whose breaker
    /// rejects the call is excluded and selection runs again; it does not
    /// count as an attempt.
    fn select_and_gate(
        &self,
        rule: &RouteRule,
        excluded: &mut HashSet<String>,
    ) -> Result<(Selection, BreakerPermit), SelectError> {
        let instances = self.registry.get_instances(&rule.service);
        let view = self.breakers.view(&rule.policy.breaker);
        let mut rejected = false;

        loop {
            let selection = match self.balancer.select(&instances, rule.policy.lb, excluded, &view) {
                Ok(selection) => selection,
                Err(SelectError::AllExcluded { service }) if rejected => {
                    return Err(SelectError::AllOpen { service });
                }
                Err(e) => return Err(e),
            };

            match self.breakers.acquire(&selection.instance, &rule.policy.breaker) {
                Ok(permit) => return Ok((selection, permit)),
                Err(rejection) => {
                    debug!(
                        breaker = %rejection.key,
                        retry_after_ms = rejection.retry_after.map(|d| d.as_millis() as u64),
                        "breaker rejected selected instance"
                    );
                    rejected = true;
                    excluded.insert(selection.instance.endpoint());
                }
            }
        }
    }
}

fn conclude(last: Option<Settled>, otherwise: GatewayError) -> Result<Response<ProxyBody>, GatewayError> {
    match last {
        Some(settled) => settled.into_result(),
        None => Err(otherwise),
    }
}

/// Publishes discovery updates to the registry, then drops balancer and
/// breaker state kept for instances that are gone.
impl<U: Upstream> InstanceSetListener for Gateway<U> {
    fn on_instance_set_changed(&self, set: InstanceSet) {
        self.registry.on_instance_set_changed(set.clone());
        self.balancer.prune(&set);
        self.breakers.prune(&set);
    }
}

/// Surface a held upstream response if there is one; an earlier
/// transport failure is replaced by `otherwise`.
fn pass_through_or(last: Option<Settled>, otherwise: GatewayError) -> Result<Response<ProxyBody>, GatewayError> {
    match last {
        Some(Settled::Response(response)) => Ok(response),
        _ => Err(otherwise),
    }
}

fn track(response: Response<ProxyBody>, guard: InFlightGuard, deadline: &Deadline) -> Response<ProxyBody> {
    use http_body_util::BodyExt;

    let at = deadline.at();
    response.map(|body| TrackedBody::new(body, guard, at).boxed_unsync())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use http::{Method, StatusCode};
    use http_body_util::{BodyExt, Full};

    use meshgate_core::{BreakerScope, GatewayConfig, Instance, ServiceName};
    use meshgate_resilience::BreakerKey;
    use meshgate_routing::RouteTable;

    use crate::body::full;
    use crate::error::ERROR_KIND_HEADER;

    #[derive(Clone, Copy)]
    enum Reply {
        Status(u16),
        Refuse,
        Hang,
    }

    /// Upstream that answers per endpoint and records every call.
    #[derive(Default)]
    struct Scripted {
        replies: HashMap<String, Reply>,
        calls: Mutex<Vec<(String, Bytes)>>,
    }

    impl Scripted {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(ep, _)| ep.clone()).collect()
        }

        fn bodies(&self) -> Vec<Bytes> {
            self.calls.lock().unwrap().iter().map(|(_, b)| b.clone()).collect()
        }
    }

    impl Upstream for Scripted {
        async fn send(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>, ForwardError> {
            let endpoint = request
                .uri()
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_default();
            let body = request.into_body().collect().await.unwrap().to_bytes();
            self.calls.lock().unwrap().push((endpoint.clone(), body));

            match self.replies.get(&endpoint).copied().unwrap_or(Reply::Status(200)) {
                Reply::Status(code) => {
                    let mut response = Response::new(full(endpoint));
                    *response.status_mut() = StatusCode::from_u16(code).unwrap();
                    Ok(response)
                }
                Reply::Refuse => Err(ForwardError::Connect("connection refused".into())),
                Reply::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    const A: &str = "10.0.0.1:80";
    const B: &str = "10.0.0.2:80";
    const C: &str = "10.0.0.3:80";

    fn gateway(config: &str, endpoints: &[&str], replies: &[(&str, Reply)]) -> Gateway<Scripted> {
        let config = GatewayConfig::from_toml_str(config).unwrap();
        let routes = Arc::new(SharedRouteTable::new(RouteTable::from_config(&config).unwrap()));

        let registry = Arc::new(InstanceRegistry::new());
        let service = ServiceName::new("users").unwrap();
        let instances = endpoints
            .iter()
            .map(|ep| {
                let (host, port) = ep.split_once(':').unwrap();
                Instance::new(service.clone(), host, port.parse().unwrap())
            })
            .collect();
        registry.apply_update(InstanceSet::new(service, instances).unwrap());

        let upstream = Scripted {
            replies: replies.iter().map(|(ep, r)| (ep.to_string(), *r)).collect(),
            ..Scripted::default()
        };
        Gateway::new(routes, registry, upstream)
    }

    const ROUTES: &str = r#"
[[routes]]
id = "users"
path = "/api/users/**"
service = "users"
"#;

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(path).body(Full::new(Bytes::new())).unwrap()
    }

    async fn text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unmatched_path_is_routing_failure() {
        let gw = gateway(ROUTES, &[A], &[]);
        let response = gw.handle(get("/static/app.js"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[&ERROR_KIND_HEADER], "routing_failure");
        assert!(gw.upstream().calls().is_empty());
    }

    #[tokio::test]
    async fn round_robin_alternates_instances() {
        let gw = gateway(ROUTES, &[A, B], &[]);
        let first = text(gw.handle(get("/api/users/1"), None).await).await;
        let second = text(gw.handle(get("/api/users/1"), None).await).await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn empty_registry_is_unavailable() {
        let gw = gateway(ROUTES, &[], &[]);
        let response = gw.handle(get("/api/users/1"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[&ERROR_KIND_HEADER], "no_instance_available");
    }

    #[tokio::test]
    async fn connect_failure_retries_on_another_instance() {
        let gw = gateway(ROUTES, &[A, B], &[(A, Reply::Refuse), (B, Reply::Refuse)]);
        let gw_ok = gateway(ROUTES, &[A, B], &[(A, Reply::Refuse)]);

        let response = gw_ok.handle(get("/api/users/1"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, B);

        let response = gw.handle(get("/api/users/1"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let calls = gw.upstream().calls();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0], calls[1]);
    }

    #[tokio::test]
    async fn attempts_never_exceed_retry_budget() {
        let config = format!("{ROUTES}\n[routes.retry]\nmax_retries = 1\n");
        let gw = gateway(
            &config,
            &[A, B, C],
            &[(A, Reply::Refuse), (B, Reply::Refuse), (C, Reply::Refuse)],
        );
        let response = gw.handle(get("/api/users/1"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(gw.upstream().calls().len(), 2);
    }

    #[tokio::test]
    async fn retryable_status_passes_through_on_last_attempt() {
        let gw = gateway(ROUTES, &[A, B], &[(A, Reply::Status(503)), (B, Reply::Status(503))]);
        let response = gw.handle(get("/api/users/1"), None).await;

        // Both instances tried; the final upstream answer is returned as is.
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!response.headers().contains_key(&ERROR_KIND_HEADER));
        assert_eq!(gw.upstream().calls().len(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let gw = gateway(ROUTES, &[A, B], &[(A, Reply::Status(404)), (B, Reply::Status(404))]);
        let response = gw.handle(get("/api/users/1"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(gw.upstream().calls().len(), 1);
    }

    #[tokio::test]
    async fn post_is_not_retried_after_upstream_status() {
        let gw = gateway(ROUTES, &[A, B], &[(A, Reply::Status(503)), (B, Reply::Status(503))]);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/users")
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();
        let response = gw.handle(request, None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(gw.upstream().calls().len(), 1);
    }

    #[tokio::test]
    async fn buffered_body_is_replayed_on_retry() {
        let gw = gateway(ROUTES, &[A, B], &[(A, Reply::Refuse), (B, Reply::Refuse)]);
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/api/users/9")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();
        gw.handle(request, None).await;

        let bodies = gw.upstream().bodies();
        assert_eq!(bodies.len(), 2);
        assert!(bodies.iter().all(|b| &b[..] == b"payload"));
    }

    #[tokio::test]
    async fn streamed_body_is_sent_once() {
        let gw = gateway(ROUTES, &[A, B], &[(A, Reply::Refuse), (B, Reply::Refuse)])
            .with_max_replayable_body_bytes(4);
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/api/users/9")
            .body(Full::new(Bytes::from_static(b"larger than four bytes")))
            .unwrap();
        let response = gw.handle(request, None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(gw.upstream().calls().len(), 1);
    }

    #[tokio::test]
    async fn open_breaker_excludes_instance() {
        let config = format!("{ROUTES}\n[routes.breaker]\nfailure_threshold = 2\n");
        let gw = gateway(&config, &[A, B], &[(A, Reply::Status(500))]);

        // Round-robin sends every other request to A.
        for _ in 0..4 {
            gw.handle(get("/api/users/1"), None).await;
        }
        let a = gw.registry().get_instances(&ServiceName::new("users").unwrap()).get(A).unwrap().clone();
        let key = BreakerKey::for_instance(&a, BreakerScope::Instance);
        assert_eq!(
            gw.breakers().get(&key).unwrap().state(),
            meshgate_core::BreakerState::Open
        );

        let before = gw.upstream().calls().len();
        for _ in 0..4 {
            let response = gw.handle(get("/api/users/1"), None).await;
            assert_eq!(text(response).await, B);
        }
        assert!(gw.upstream().calls()[before..].iter().all(|ep| ep == B));
    }

    #[tokio::test]
    async fn all_breakers_open_is_breaker_open() {
        let config = format!("{ROUTES}\n[routes.retry]\nmax_retries = 0\n[routes.breaker]\nfailure_threshold = 1\n");
        let gw = gateway(&config, &[A], &[(A, Reply::Refuse)]);

        let response = gw.handle(get("/api/users/1"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = gw.handle(get("/api/users/1"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[&ERROR_KIND_HEADER], "breaker_open");
        assert_eq!(gw.upstream().calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_skipped_when_deadline_too_close() {
        let config = r#"
[[routes]]
id = "users"
path = "/api/users/**"
service = "users"
timeout = "2s"
per_try_timeout = "1500ms"

[routes.retry]
min_retry_window = "1s"
"#;
        let gw = gateway(config, &[A, B], &[(A, Reply::Hang), (B, Reply::Hang)]);

        let started = Instant::now();
        let response = gw.handle(get("/api/users/1"), None).await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers()[&ERROR_KIND_HEADER], "deadline_exceeded");
        assert_eq!(gw.upstream().calls().len(), 1);
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_timeout_does_not_count_against_breaker() {
        let config = r#"
[[routes]]
id = "users"
path = "/api/users/**"
service = "users"
timeout = "1s"

[routes.breaker]
failure_threshold = 1
"#;
        let gw = gateway(config, &[A], &[(A, Reply::Hang)]);

        let response = gw.handle(get("/api/users/1"), None).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let a = Instance::new(ServiceName::new("users").unwrap(), "10.0.0.1", 80);
        let breaker = gw
            .breakers()
            .get(&BreakerKey::for_instance(&a, BreakerScope::Instance))
            .unwrap();
        assert_eq!(breaker.state(), meshgate_core::BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn in_flight_released_after_response_body() {
        let gw = gateway(ROUTES, &[A], &[]);
        let a = Instance::new(ServiceName::new("users").unwrap(), "10.0.0.1", 80);

        let response = gw.handle(get("/api/users/1"), None).await;
        assert_eq!(gw.balancer().in_flight().get(&a), 1);
        text(response).await;
        assert_eq!(gw.balancer().in_flight().get(&a), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn held_status_surfaces_when_retry_runs_out_of_time() {
        let config = r#"
[[routes]]
id = "users"
path = "/api/users/**"
service = "users"
timeout = "1s"
"#;
        let gw = gateway(config, &[A, B], &[(A, Reply::Status(503)), (B, Reply::Hang)]);

        let response = gw.handle(get("/api/users/1"), None).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!response.headers().contains_key(&ERROR_KIND_HEADER));
        assert_eq!(text(response).await, A);
        assert_eq!(gw.upstream().calls(), vec![A.to_string(), B.to_string()]);
    }

    #[tokio::test]
    async fn membership_change_prunes_departed_instance_state() {
        let gw = gateway(ROUTES, &[A, B], &[]);
        let users = ServiceName::new("users").unwrap();
        for _ in 0..2 {
            text(gw.handle(get("/api/users/1"), None).await).await;
        }
        let a = Instance::new(users.clone(), "10.0.0.1", 80);
        let b = Instance::new(users.clone(), "10.0.0.2", 80);
        let key_a = BreakerKey::for_instance(&a, BreakerScope::Instance);
        let key_b = BreakerKey::for_instance(&b, BreakerScope::Instance);
        assert!(gw.breakers().get(&key_b).is_some());
        assert_eq!(gw.balancer().in_flight().tracked(), 2);

        gw.on_instance_set_changed(InstanceSet::new(users.clone(), vec![a.clone()]).unwrap());
        assert_eq!(gw.registry().get_instances(&users).len(), 1);
        assert!(gw.breakers().get(&key_a).is_some());
        assert!(gw.breakers().get(&key_b).is_none());
        assert_eq!(gw.balancer().in_flight().tracked(), 1);

        gw.on_instance_set_changed(InstanceSet::empty(users.clone()));
        assert!(gw.registry().get_instances(&users).is_empty());
        assert!(gw.breakers().get(&key_a).is_none());
        assert_eq!(gw.balancer().in_flight().tracked(), 0);
    }
}
