//! Caller-visible failures.
//!
//! Every failure carries a stable machine-readable kind. Messages name
//! services and routes but never instance addresses.

use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Method, Response, StatusCode};
use thiserror::Error;

use meshgate_balance::SelectError;
use meshgate_core::ServiceName;
use meshgate_resilience::ForwardError;
use meshgate_routing::RouteNotFound;

use crate::body::{ProxyBody, full};

pub const ERROR_KIND_HEADER: HeaderName = HeaderName::from_static("x-meshgate-error");

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches {method} {path}")]
    RoutingFailure { method: Method, path: String },

    #[error("no instance of {service} is available")]
    NoInstanceAvailable { service: ServiceName },

    #[error("circuit breakers are open for every instance of {service}")]
    BreakerOpen { service: ServiceName },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("upstream {service} failed after {attempts} attempt(s): {error}")]
    Upstream {
        service: ServiceName,
        attempts: u32,
        error: ForwardError,
    },

    #[error("request body could not be read")]
    BadRequest,
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RoutingFailure { .. } => "routing_failure",
            GatewayError::NoInstanceAvailable { .. } => "no_instance_available",
            GatewayError::BreakerOpen { .. } => "breaker_open",
            GatewayError::DeadlineExceeded => "deadline_exceeded",
            GatewayError::Upstream {
                error: ForwardError::Timeout(_),
                ..
            } => "upstream_timeout",
            GatewayError::Upstream { .. } => "upstream_failure",
            GatewayError::BadRequest => "bad_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RoutingFailure { .. } => StatusCode::NOT_FOUND,
            GatewayError::NoInstanceAvailable { .. } | GatewayError::BreakerOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream {
                error: ForwardError::Timeout(_),
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Detail safe to show the caller.
    fn public_message(&self) -> String {
        match self {
            GatewayError::Upstream {
                service,
                attempts,
                error,
            } => format!(
                "upstream {service} failed after {attempts} attempt(s) ({})",
                error.kind()
            ),
            other => other.to_string(),
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        let kind = self.kind();
        let body = serde_json::json!({
            "error": {
                "kind": kind,
                "message": self.public_message(),
            }
        });

        let mut response = Response::new(full(body.to_string()));
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ERROR_KIND_HEADER, HeaderValue::from_static(kind));
        response
    }
}

impl From<RouteNotFound> for GatewayError {
    fn from(e: RouteNotFound) -> Self {
        GatewayError::RoutingFailure {
            method: e.method,
            path: e.path,
        }
    }
}

impl From<SelectError> for GatewayError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::AllOpen { service } => GatewayError::BreakerOpen { service },
            SelectError::NoInstances { service } | SelectError::AllExcluded { service } => {
                GatewayError::NoInstanceAvailable { service }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use http_body_util::BodyExt;

    async fn body_json(response: Response<ProxyBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn status_mapping() {
        let service = ServiceName::new("users").unwrap();
        assert_eq!(
            GatewayError::RoutingFailure {
                method: Method::GET,
                path: "/x".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::from(SelectError::NoInstances {
                service: service.clone()
            })
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let open = GatewayError::from(SelectError::AllOpen {
            service: service.clone(),
        });
        assert_eq!(open.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(open.kind(), "breaker_open");

        assert_eq!(GatewayError::DeadlineExceeded.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::Upstream {
                service,
                attempts: 3,
                error: ForwardError::Connect("refused".into())
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn response_hides_instance_addresses() {
        let err = GatewayError::Upstream {
            service: ServiceName::new("users").unwrap(),
            attempts: 2,
            error: ForwardError::Connect("tcp connect error 10.0.0.7:8080".into()),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[&ERROR_KIND_HEADER], "upstream_failure");

        let json = body_json(response).await;
        assert_eq!(json["error"]["kind"], "upstream_failure");
        let message = json["error"]["message"].as_str().unwrap();
        assert!(message.contains("users"));
        assert!(!message.contains("10.0.0.7"));
    }

    #[tokio::test]
    async fn upstream_timeout_is_gateway_timeout() {
        let response = GatewayError::Upstream {
            service: ServiceName::new("users").unwrap(),
            attempts: 1,
            error: ForwardError::Timeout(Duration::from_secs(1)),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["error"]["kind"], "upstream_timeout");
    }
}
