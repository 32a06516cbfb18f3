//! Request forwarder — one outbound call to one selected instance.

use std::future::Future;
use std::time::Duration;

use http::header::{self, HeaderValue};
use http::{Request, Response, Uri, Version};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use meshgate_core::Instance;
use meshgate_resilience::ForwardError;

use crate::body::{ProxyBody, boxed};
use crate::context::{RequestContext, strip_hop_by_hop};

/// Transport that sends a fully built request to an upstream.
pub trait Upstream: Send + Sync + 'static {
    fn send(
        &self,
        request: Request<ProxyBody>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, ForwardError>> + Send;
}

/// Pooled HTTP/1.1 client.
#[derive(Clone)]
pub struct HttpUpstream {
    client: Client<HttpConnector, ProxyBody>,
}

impl HttpUpstream {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }
}

impl Default for HttpUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Upstream for HttpUpstream {
    async fn send(&self, request: Request<ProxyBody>) -> Result<Response<ProxyBody>, ForwardError> {
        match self.client.request(request).await {
            Ok(response) => Ok(response.map(boxed)),
            Err(e) if e.is_connect() => Err(ForwardError::Connect(e.to_string())),
            Err(e) => Err(ForwardError::Protocol(e.to_string())),
        }
    }
}

/// Builds outbound requests and enforces the attempt timeout.
pub struct Forwarder<U> {
    upstream: U,
}

impl<U: Upstream> Forwarder<U> {
    pub fn new(upstream: U) -> Self {
        Self { upstream }
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Send `ctx` to `instance` with `body`, waiting at most `timeout`
    /// for the response head. The response body streams afterwards.
    pub async fn forward(
        &self,
        instance: &Instance,
        ctx: &RequestContext,
        body: ProxyBody,
        timeout: Duration,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let request = build_request(instance, ctx, body)?;

        let mut response = match tokio::time::timeout(timeout, self.upstream.send(request)).await {
            Ok(result) => result?,
            Err(_) => return Err(ForwardError::Timeout(timeout)),
        };
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

/// Point the request at `instance`, keeping method, headers, and body.
pub fn build_request(
    instance: &Instance,
    ctx: &RequestContext,
    body: ProxyBody,
) -> Result<Request<ProxyBody>, ForwardError> {
    let authority = instance.endpoint();
    let uri: Uri = format!("http://{authority}{}", ctx.path_and_query)
        .parse()
        .map_err(|e| ForwardError::Protocol(format!("invalid upstream uri: {e}")))?;
    let host = HeaderValue::from_str(&authority)
        .map_err(|e| ForwardError::Protocol(format!("invalid upstream host: {e}")))?;

    let mut request = Request::new(body);
    *request.method_mut() = ctx.method.clone();
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = ctx.headers.clone();
    request.headers_mut().insert(header::HOST, host);
    Ok(request)
}
