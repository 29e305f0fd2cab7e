//! Observation of the network traffic a check generates.
//!
//! A [`CaptureSession`] wraps one [`CaptureBackend`] run around a single
//! probe. The session is started before the request goes out and stopped a
//! grace period after the response completed, never later than the maximum
//! window. Any backend failure degrades to an empty capture.

pub mod noop;
pub mod tcpdump;

pub use noop::NoopBackend;
pub use tcpdump::TcpdumpBackend;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, warn};
use url::Url;

/// How long a backend gets to wind down once asked to stop
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture tool unavailable: {0}")]
    Unavailable(String),
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture process exited early: {0}")]
    Exited(String),
    #[error("cannot scope capture to the target: {0}")]
    Unscoped(String),
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// One observed network exchange, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub observed_at: DateTime<Utc>,
    pub transport: Option<Transport>,
    pub remote_ip: Option<IpAddr>,
    pub remote_port: Option<u16>,
    /// Host name seen on the wire (HTTP `Host`, TLS SNI) or in the document
    pub host: Option<String>,
    /// Absolute URL, when it could be observed directly
    pub url: Option<Url>,
    /// Plaintext HTTP request target
    pub path: Option<String>,
    pub tls_handshake: bool,
    pub content_type: Option<String>,
    /// Cookie, Set-Cookie or Authorization seen in the exchange
    pub session_bearing: bool,
}

impl RawEvent {
    pub fn new(observed_at: DateTime<Utc>) -> Self {
        Self {
            observed_at,
            transport: None,
            remote_ip: None,
            remote_port: None,
            host: None,
            url: None,
            path: None,
            tls_handshake: false,
            content_type: None,
            session_bearing: false,
        }
    }

    /// Event for a resource whose absolute URL is known
    pub fn for_url(observed_at: DateTime<Utc>, url: Url) -> Self {
        let mut event = Self::new(observed_at);
        event.host = url.host_str().map(str::to_string);
        event.remote_port = url.port_or_known_default();
        event.url = Some(url);
        event
    }
}

/// Capability interface over a packet-capture mechanism
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `false` for backends that never observe anything; sessions skip them
    /// without waiting out a window.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Begin observing traffic for a probe of `target`. The capture must end
    /// on its own once `max_window` has elapsed.
    async fn start(
        &self,
        target: &Url,
        max_window: Duration,
    ) -> Result<Box<dyn ActiveCapture>, CaptureError>;
}

/// A running capture
#[async_trait]
pub trait ActiveCapture: Send {
    async fn stop(self: Box<Self>) -> Result<Vec<RawEvent>, CaptureError>;
}

/// Timing of the capture window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Pause after starting the backend so it is listening before the probe
    pub warmup: Duration,
    /// Extra observation time after the response completed
    pub grace: Duration,
    /// Hard cap on the whole window, measured from session start
    pub max_window: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            warmup: Duration::from_millis(500),
            grace: Duration::from_secs(2),
            max_window: Duration::from_secs(15),
        }
    }
}

/// Capture scoped to one check
pub struct CaptureSession {
    active: Option<Box<dyn ActiveCapture>>,
    started: Instant,
    settings: CaptureSettings,
    backend: &'static str,
}

impl CaptureSession {
    pub async fn start(backend: &dyn CaptureBackend, target: &Url, settings: CaptureSettings) -> Self {
        let started = Instant::now();
        if !backend.is_enabled() {
            return Self { active: None, started, settings, backend: backend.name() };
        }

        let active = match backend.start(target, settings.max_window).await {
            Ok(active) => {
                if !settings.warmup.is_zero() {
                    sleep(settings.warmup).await;
                }
                Some(active)
            }
            Err(e) => {
                warn!(backend = backend.name(), target = %target, error = %e, "Capture unavailable, continuing without it");
                None
            }
        };

        Self { active, started, settings, backend: backend.name() }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Close the window and return what was observed.
    ///
    /// Call right after the probe completed: the capture keeps running for
    /// the grace period, cut short by the maximum window.
    pub async fn finish(self) -> Vec<RawEvent> {
        let Some(active) = self.active else {
            return Vec::new();
        };

        let hard_stop = self.started + self.settings.max_window;
        let deadline = (Instant::now() + self.settings.grace).min(hard_stop);
        sleep_until(deadline).await;

        match timeout(STOP_TIMEOUT, active.stop()).await {
            Ok(Ok(events)) => {
                debug!(backend = self.backend, events = events.len(), "Capture finished");
                events
            }
            Ok(Err(e)) => {
                warn!(backend = self.backend, error = %e, "Capture failed, returning empty capture");
                Vec::new()
            }
            Err(_) => {
                warn!(backend = self.backend, "Capture did not stop in time, returning empty capture");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBackend(Vec<RawEvent>);
    struct FixedCapture(Vec<RawEvent>);
    struct BrokenBackend;

    #[async_trait]
    impl CaptureBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn start(&self, _: &Url, _: Duration) -> Result<Box<dyn ActiveCapture>, CaptureError> {
            Ok(Box::new(FixedCapture(self.0.clone())))
        }
    }

    #[async_trait]
    impl ActiveCapture for FixedCapture {
        async fn stop(self: Box<Self>) -> Result<Vec<RawEvent>, CaptureError> {
            Ok(self.0)
        }
    }

    #[async_trait]
    impl CaptureBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn start(&self, _: &Url, _: Duration) -> Result<Box<dyn ActiveCapture>, CaptureError> {
            Err(CaptureError::Unavailable("tcpdump not found".into()))
        }
    }

    fn target() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            warmup: Duration::from_millis(500),
            grace: Duration::from_secs(2),
            max_window: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_response_plus_grace() {
        let event = RawEvent::for_url(Utc::now(), Url::parse("https://cdn.example.com/a.js").unwrap());
        let session = CaptureSession::start(&FixedBackend(vec![event.clone()]), &target(), settings()).await;
        assert!(session.is_active());

        let response_done = Instant::now();
        let events = session.finish().await;

        assert_eq!(response_done.elapsed(), Duration::from_secs(2));
        assert_eq!(events, vec![event]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_capped_at_maximum() {
        let started = Instant::now();
        let session = CaptureSession::start(&FixedBackend(Vec::new()), &target(), settings()).await;

        // Slow probe: response arrives 9s into a 10s window.
        tokio::time::advance(Duration::from_millis(8_500)).await;
        session.finish().await;

        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_backend_skips_the_window() {
        let started = Instant::now();
        let session = CaptureSession::start(&NoopBackend, &target(), settings()).await;

        assert!(!session.is_active());
        assert!(session.finish().await.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_backend_yields_empty_capture() {
        let started = Instant::now();
        let session = CaptureSession::start(&BrokenBackend, &target(), settings()).await;
        assert!(!session.is_active());

        assert!(session.finish().await.is_empty());
        // No warm-up or grace wait without an active capture.
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
