//! Inbound HTTP server.
//!
//! Accepts HTTP/1.1 connections and hands every request to the
//! `Gateway`, one task per connection.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::forwarder::Upstream;
use crate::gateway::Gateway;

/// Pause after an accept error that is not specific to one connection,
/// such as running out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Gateway listener.
pub struct GatewayServer<U> {
    listener: TcpListener,
    gateway: Arc<Gateway<U>>,
    next_request_id: Arc<AtomicU64>,
}

impl<U: Upstream> GatewayServer<U> {
    pub async fn bind(addr: SocketAddr, gateway: Arc<Gateway<U>>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gateway listener on {addr}"))?;
        Ok(Self {
            listener,
            gateway,
            next_request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("listener has no local address")
    }

    /// Serve until the shutdown signal flips. Connections already
    /// accepted run to completion on their own tasks.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "gateway listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            let Some(backoff) = accept_backoff(&e) else {
                                debug!(error = %e, "connection dropped before accept");
                                continue;
                            };
                            warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "accept failed");
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => continue,
                                _ = shutdown.changed() => {
                                    info!("gateway listener shutting down");
                                    break;
                                }
                            }
                        }
                    };
                    let gateway = self.gateway.clone();
                    let ids = self.next_request_id.clone();

                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let svc = service_fn(move |req: Request<Incoming>| {
                            let gateway = gateway.clone();
                            let span = info_span!(
                                "request",
                                id = ids.fetch_add(1, Ordering::Relaxed),
                                method = %req.method(),
                                path = %req.uri().path(),
                            );
                            async move { Ok::<_, Infallible>(gateway.handle(req, Some(peer)).await) }
                                .instrument(span)
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("gateway listener shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// How long to wait before accepting again, or `None` when the error
/// only concerns the connection being accepted.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => None,
        _ => Some(ACCEPT_ERROR_BACKOFF),
    }
}
