//! Discovery push API.
//!
//! External discovery sources report membership here. Every write goes
//! through the `DiscoveryCoalescer`, which republishes the full set to
//! the registry.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/v1/services` | Services with published and tracked counts |
//! | GET | `/v1/services/{name}/instances` | Tracked instances with health marks |
//! | PUT | `/v1/services/{name}/instances` | Replace the whole membership |
//! | POST | `/v1/services/{name}/instances` | Register one instance |
//! | PATCH | `/v1/services/{name}/instances/{endpoint}` | Heartbeat: weight or metadata |
//! | DELETE | `/v1/services/{name}/instances/{endpoint}` | Deregister |

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use serde::{Deserialize, Serialize};
use tracing::debug;

use meshgate_core::{Instance, ServiceName};
use meshgate_registry::{DiscoveryCoalescer, DiscoveryEvent, InstanceRegistry, TrackedInstance};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct DiscoveryState {
    pub coalescer: Arc<DiscoveryCoalescer>,
    pub registry: Arc<InstanceRegistry>,
}

/// Build the discovery API router.
pub fn build_router(state: DiscoveryState) -> Router {
    let api_routes = Router::new()
        .route("/services", get(list_services))
        .route(
            "/services/{name}/instances",
            get(list_instances).put(replace_instances).post(register_instance),
        )
        .route(
            "/services/{name}/instances/{endpoint}",
            patch(update_instance).delete(deregister_instance),
        )
        .with_state(state);

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", api_routes)
}

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Body of a registration: the service comes from the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

impl InstanceSpec {
    fn into_instance(self, service: &ServiceName) -> Result<Instance, String> {
        if self.host.trim().is_empty() {
            return Err("instance host must not be empty".to_string());
        }
        Ok(Instance {
            service: service.clone(),
            host: self.host,
            port: self.port,
            weight: self.weight,
            metadata: self.metadata,
        })
    }
}

/// Heartbeat body. Absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceUpdate {
    pub weight: Option<u32>,
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceView {
    pub endpoint: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub metadata: BTreeMap<String, String>,
    pub healthy: bool,
}

impl From<TrackedInstance> for InstanceView {
    fn from(tracked: TrackedInstance) -> Self {
        let endpoint = tracked.instance.endpoint();
        Self {
            endpoint,
            host: tracked.instance.host,
            port: tracked.instance.port,
            weight: tracked.instance.weight,
            metadata: tracked.instance.metadata,
            healthy: tracked.healthy,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    /// Instances currently eligible for routing.
    pub published: usize,
    /// Instances known to discovery, healthy or not.
    pub tracked: usize,
}

fn parse_service(name: &str) -> Result<ServiceName, Response> {
    ServiceName::new(name).map_err(|e| error_response(&e.to_string(), StatusCode::BAD_REQUEST))
}

fn tracked_views(state: &DiscoveryState, service: &ServiceName) -> Vec<InstanceView> {
    state
        .coalescer
        .tracked(service)
        .into_iter()
        .map(InstanceView::from)
        .collect()
}

// ── Handlers ──────────────────────────────────────────────────────

/// GET /healthz
async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

/// GET /v1/services
async fn list_services(State(state): State<DiscoveryState>) -> impl IntoResponse {
    let mut names = state.registry.list_services();
    for name in state.coalescer.tracked_services() {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names.sort();

    let summaries: Vec<ServiceSummary> = names
        .into_iter()
        .map(|name| ServiceSummary {
            published: state.registry.get_instances(&name).len(),
            tracked: state.coalescer.tracked(&name).len(),
            name: name.to_string(),
        })
        .collect();
    ApiResponse::ok(summaries)
}

/// GET /v1/services/{name}/instances
async fn list_instances(
    State(state): State<DiscoveryState>,
    Path(name): Path<String>,
) -> Response {
    match parse_service(&name) {
        Ok(service) => ApiResponse::ok(tracked_views(&state, &service)).into_response(),
        Err(response) => response,
    }
}

/// PUT /v1/services/{name}/instances
async fn replace_instances(
    State(state): State<DiscoveryState>,
    Path(name): Path<String>,
    Json(specs): Json<Vec<InstanceSpec>>,
) -> Response {
    let service = match parse_service(&name) {
        Ok(service) => service,
        Err(response) => return response,
    };

    let mut instances = Vec::with_capacity(specs.len());
    for spec in specs {
        match spec.into_instance(&service) {
            Ok(instance) => instances.push(instance),
            Err(e) => return error_response(&e, StatusCode::BAD_REQUEST),
        }
    }

    debug!(service = %service, count = instances.len(), "membership replaced via API");
    state.coalescer.replace(&service, instances);
    ApiResponse::ok(tracked_views(&state, &service)).into_response()
}

/// POST /v1/services/{name}/instances
async fn register_instance(
    State(state): State<DiscoveryState>,
    Path(name): Path<String>,
    Json(spec): Json<InstanceSpec>,
) -> Response {
    let service = match parse_service(&name) {
        Ok(service) => service,
        Err(response) => return response,
    };
    let instance = match spec.into_instance(&service) {
        Ok(instance) => instance,
        Err(e) => return error_response(&e, StatusCode::BAD_REQUEST),
    };

    let endpoint = instance.endpoint();
    state.coalescer.apply(DiscoveryEvent::Registered(instance));

    match state
        .coalescer
        .tracked(&service)
        .into_iter()
        .find(|t| t.instance.endpoint() == endpoint)
    {
        Some(tracked) => (StatusCode::CREATED, ApiResponse::ok(InstanceView::from(tracked))).into_response(),
        None => error_response("instance was not tracked", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// PATCH /v1/services/{name}/instances/{endpoint}
async fn update_instance(
    State(state): State<DiscoveryState>,
    Path((name, endpoint)): Path<(String, String)>,
    Json(update): Json<InstanceUpdate>,
) -> Response {
    let service = match parse_service(&name) {
        Ok(service) => service,
        Err(response) => return response,
    };
    if !state
        .coalescer
        .tracked(&service)
        .iter()
        .any(|t| t.instance.endpoint() == endpoint)
    {
        return error_response("instance not found", StatusCode::NOT_FOUND);
    }

    state.coalescer.apply(DiscoveryEvent::Updated {
        service: service.clone(),
        endpoint: endpoint.clone(),
        weight: update.weight,
        metadata: update.metadata,
    });

    match state
        .coalescer
        .tracked(&service)
        .into_iter()
        .find(|t| t.instance.endpoint() == endpoint)
    {
        Some(tracked) => ApiResponse::ok(InstanceView::from(tracked)).into_response(),
        None => error_response("instance not found", StatusCode::NOT_FOUND),
    }
}

/// DELETE /v1/services/{name}/instances/{endpoint}
async fn deregister_instance(
    State(state): State<DiscoveryState>,
    Path((name, endpoint)): Path<(String, String)>,
) -> Response {
    let service = match parse_service(&name) {
        Ok(service) => service,
        Err(response) => return response,
    };

    if state.coalescer.apply(DiscoveryEvent::Deregistered {
        service,
        endpoint: endpoint.clone(),
    }) {
        ApiResponse::ok(endpoint).into_response()
    } else {
        error_response("instance not found", StatusCode::NOT_FOUND)
    }
}
