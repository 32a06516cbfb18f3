//! Request and response bodies.
//!
//! Small request bodies are buffered once so a retry can send them
//! again; anything larger streams straight through and can be sent only
//! once. Response bodies stream back to the caller wrapped in
//! `TrackedBody`, which keeps the instance counted as in flight and
//! cuts the stream off when the request deadline passes. A response held
//! back while a retry runs is buffered instead, so it can still be
//! surfaced after the deadline.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Response, header};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Frame, SizeHint};
use thiserror::Error;
use tokio::time::{Instant, Sleep};

use meshgate_balance::InFlightGuard;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both sides of the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty() -> ProxyBody {
    full(Bytes::new())
}

pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// An inbound request body, ready to hand to one or more attempts.
pub enum RequestBody {
    /// Fully buffered; every attempt gets a copy.
    Replayable(Bytes),
    /// Streamed through; `None` once an attempt has taken it.
    Streaming(Option<ProxyBody>),
}

impl RequestBody {
    /// Buffer `body` if its known size is at most `limit` bytes,
    /// otherwise keep it as a stream.
    pub async fn prepare<B>(body: B, content_length: Option<u64>, limit: usize) -> Result<Self, BoxError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let size = body.size_hint().exact().or(content_length);
        match size {
            Some(size) if size <= limit as u64 => {
                let collected = Limited::new(body, limit).collect().await?;
                Ok(RequestBody::Replayable(collected.to_bytes()))
            }
            _ => Ok(RequestBody::Streaming(Some(boxed(body)))),
        }
    }

    pub fn is_replayable(&self) -> bool {
        matches!(self, RequestBody::Replayable(_))
    }

    /// Body for the next attempt. A streamed body is handed out once.
    pub fn take(&mut self) -> Option<ProxyBody> {
        match self {
            RequestBody::Replayable(bytes) => Some(full(bytes.clone())),
            RequestBody::Streaming(body) => body.take(),
        }
    }
}

/// Read a response body of at most `limit` bytes into memory, waiting
/// no later than `deadline`. A body that is too large, fails, or is late
/// is dropped and the status and headers are kept with an empty body.
pub async fn buffer_response(response: Response<ProxyBody>, limit: usize, deadline: Instant) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    let collect = collect_limited(body, limit);
    match tokio::time::timeout_at(deadline, collect).await {
        Ok(Ok(collected)) => Response::from_parts(parts, full(collected.to_bytes())),
        _ => {
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, empty())
        }
    }
}

/// Collect at most `limit` bytes of `body`. Kept generic so the
/// future's `Send` bound is proven where the error bound is in scope.
fn collect_limited<B>(
    body: B,
    limit: usize,
) -> impl Future<Output = Result<http_body_util::Collected<Bytes>, BoxError>> + Send
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    Limited::new(body, limit).collect()
}

/// The response stream outlived the request deadline.
#[derive(Debug, Error)]
#[error("request deadline elapsed while streaming the response")]
pub struct DeadlineElapsed;

/// Upstream response body bound to its request's lifetime.
pub struct TrackedBody {
    inner: ProxyBody,
    deadline: Pin<Box<Sleep>>,
    _in_flight: InFlightGuard,
}

impl TrackedBody {
    pub fn new(inner: ProxyBody, in_flight: InFlightGuard, deadline: Instant) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            _in_flight: in_flight,
        }
    }
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(DeadlineElapsed.into())));
        }
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use meshgate_balance::InFlightTracker;
    use meshgate_core::{Instance, ServiceName};

    #[tokio::test]
    async fn small_bodies_are_replayable() {
        let mut body = RequestBody::prepare(Full::new(Bytes::from_static(b"hello")), None, 16)
            .await
            .unwrap();
        assert!(body.is_replayable());

        for _ in 0..2 {
            let bytes = body.take().unwrap().collect().await.unwrap().to_bytes();
            assert_eq!(&bytes[..], b"hello");
        }
    }

    #[tokio::test]
    async fn large_bodies_stream_once() {
        let payload = Bytes::from(vec![7u8; 1024]);
        let mut body = RequestBody::prepare(Full::new(payload.clone()), None, 16).await.unwrap();
        assert!(!body.is_replayable());

        let bytes = body.take().unwrap().collect().await.unwrap().to_bytes();
        assert_eq!(bytes, payload);
        assert!(body.take().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_body_holds_in_flight_until_dropped() {
        let tracker = InFlightTracker::new();
        let instance = Instance::new(ServiceName::new("api").unwrap(), "10.0.0.1", 80);

        let body = TrackedBody::new(
            full("ok"),
            tracker.acquire(&instance),
            Instant::now() + Duration::from_secs(5),
        );
        assert_eq!(tracker.get(&instance), 1);

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
        assert_eq!(tracker.get(&instance), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_body_fails_after_deadline() {
        let tracker = InFlightTracker::new();
        let instance = Instance::new(ServiceName::new("api").unwrap(), "10.0.0.1", 80);
        let body = TrackedBody::new(
            full("late"),
            tracker.acquire(&instance),
            Instant::now() + Duration::from_millis(10),
        );

        tokio::time::advance(Duration::from_millis(20)).await;
        match body.collect().await {
            Ok(_) => panic!("body outlived its deadline"),
            Err(err) => assert!(err.is::<DeadlineElapsed>()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_response_outlives_deadline() {
        let deadline = Instant::now() + Duration::from_millis(10);
        let response = Response::builder().status(503).body(full("busy")).unwrap();

        let held = buffer_response(response, 1024, deadline).await;
        tokio::time::advance(Duration::from_millis(20)).await;

        assert_eq!(held.status(), 503);
        let bytes = held.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"busy");
    }

    #[tokio::test]
    async fn oversized_response_keeps_status_only() {
        let response = Response::builder()
            .status(502)
            .header(header::CONTENT_LENGTH, "1024")
            .body(full(vec![1u8; 1024]))
            .unwrap();

        let held = buffer_response(response, 16, Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(held.status(), 502);
        assert!(held.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(held.into_body().collect().await.unwrap().to_bytes().is_empty());
    }
}
