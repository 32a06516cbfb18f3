//! Health check probe logic.
//!
//! Performs HTTP health checks against instance endpoints with
//! configurable thresholds and exponential backoff.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use tracing::{debug, warn};

use meshgate_core::config::HealthCheckConfig;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not complete (connection error or timeout).
    Failed,
}

/// Verdict for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Not probed yet.
    Unknown,
    Healthy,
    Unhealthy,
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
}

impl HealthTracker {
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self::with_thresholds(
            config.unhealthy_threshold,
            config.healthy_threshold,
            config.interval,
        )
    }

    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32, interval: Duration) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                self.current_backoff = self.base_interval;

                // An unprobed instance is admitted on its first success;
                // an ejected one needs the full healthy threshold.
                let needed = match self.status {
                    HealthStatus::Unhealthy => self.healthy_threshold,
                    _ => 1,
                };
                if self.consecutive_successes >= needed {
                    if self.status == HealthStatus::Unhealthy {
                        debug!(successes = self.consecutive_successes, "instance recovered");
                    }
                    self.status = HealthStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                self.current_backoff = (self.current_backoff * 2).min(MAX_BACKOFF);

                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "instance failing health checks"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Wait before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }

    /// Whether the instance should be left out of the published set.
    pub fn is_ejected(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// Perform an HTTP GET probe against `authority` (host:port).
///
/// Returns `Healthy` for 2xx, `Unhealthy` for any other status, and
/// `Failed` when the connection fails or the probe times out.
pub async fn http_probe(authority: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{authority}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(authority).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method(http::Method::GET)
            .uri(path)
            .header(http::header::HOST, authority)
            .header(http::header::USER_AGENT, "meshgate-health/0.1")
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        ProbeResult::Failed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            ..HealthCheckConfig::default()
        }
    }

    #[test]
    fn first_success_admits_unprobed_instance() {
        let mut tracker = HealthTracker::new(&config());
        assert_eq!(tracker.status(), HealthStatus::Unknown);
        assert_eq!(tracker.record(ProbeResult::Healthy), HealthStatus::Healthy);
    }

    #[test]
    fn ejected_at_threshold() {
        let mut tracker = HealthTracker::new(&config());
        tracker.record(ProbeResult::Healthy);

        tracker.record(ProbeResult::Unhealthy);
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.consecutive_failures(), 2);

        assert_eq!(tracker.record(ProbeResult::Unhealthy), HealthStatus::Unhealthy);
        assert!(tracker.is_ejected());
    }

    #[test]
    fn readmission_needs_healthy_threshold() {
        let mut tracker = HealthTracker::new(&config());
        for _ in 0..3 {
            tracker.record(ProbeResult::Failed);
        }
        assert!(tracker.is_ejected());

        assert_eq!(tracker.record(ProbeResult::Healthy), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(ProbeResult::Healthy), HealthStatus::Healthy);
    }

    #[test]
    fn backoff_doubles_then_caps_and_resets() {
        let mut tracker = HealthTracker::with_thresholds(100, 1, Duration::from_secs(1));
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));

        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));
        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        for _ in 0..10 {
            tracker.record(ProbeResult::Failed);
        }
        assert_eq!(tracker.next_interval(), MAX_BACKOFF);

        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn probe_against_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = http_probe(&addr.to_string(), "/healthz", Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Failed);
    }
}
