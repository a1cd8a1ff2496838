//! Network probe health checkers.
//!
//! [`ProbeCheckerFactory`] creates a checker that probes its endpoint right
//! away, reports the outcome and reschedules itself after the context's retry
//! delay. It stops when its handle is closed, when the context rejects new
//! work or when the backoff is misconfigured.

use crate::health::{CheckerError, ContextError, HealthChecker, HealthCheckerContext, HealthCheckerFactory};
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use http_body_util::Empty;
use hyper::Request;
use hyper::header::{CONNECTION, HOST};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Default probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a probe checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Healthy if a TCP connection can be established.
    Tcp,
    /// Healthy if a `HEAD` request to `path` answers with `expected_status`.
    Http { path: String, expected_status: u16 },
}

impl Probe {
    /// HTTP probe expecting `200 OK`.
    pub fn http(path: impl Into<String>) -> Self {
        Probe::Http {
            path: path.into(),
            expected_status: 200,
        }
    }
}

/// Creates probing health checkers.
#[derive(Debug, Clone)]
pub struct ProbeCheckerFactory {
    probe: Probe,
    timeout: Duration,
}

impl ProbeCheckerFactory {
    /// Create a factory. `timeout` bounds each probe attempt.
    pub fn new(probe: Probe, timeout: Duration) -> Self {
        Self { probe, timeout }
    }

    /// The probe run by created checkers.
    pub fn probe(&self) -> &Probe {
        &self.probe
    }
}

impl HealthCheckerFactory for ProbeCheckerFactory {
    fn create(&self, ctx: Arc<HealthCheckerContext>) -> Box<dyn HealthChecker> {
        let state = Arc::new(ProbeState {
            ctx,
            probe: self.probe.clone(),
            timeout: self.timeout,
            closed: AtomicBool::new(false),
        });

        let first = Arc::clone(&state).check();
        if let Err(e) = state.ctx.execute(first) {
            debug!(error = %e, "probe not started");
        }
        Box::new(ProbeHandle { state })
    }
}

struct ProbeState {
    ctx: Arc<HealthCheckerContext>,
    probe: Probe,
    timeout: Duration,
    closed: AtomicBool,
}

impl ProbeState {
    fn check(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.closed.load(Ordering::Acquire) {
                return;
            }

            let result = self.probe_once().await;
            // Stopped while probing
            if self.closed.load(Ordering::Acquire) {
                return;
            }

            let endpoint = self.ctx.endpoint();
            match result {
                Ok(()) => {
                    debug!(endpoint = %endpoint, "health check passed");
                    self.ctx.update_health(1.0);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "health check failed");
                    self.ctx.update_health(0.0);
                }
            }

            self.schedule_next();
        }
        .boxed()
    }

    fn schedule_next(self: Arc<Self>) {
        let delay = match self.ctx.next_delay() {
            Ok(delay) => delay,
            Err(e) => {
                error!(error = %e, "stopping health checks");
                return;
            }
        };

        let next = Arc::clone(&self).check();
        match self.ctx.schedule(delay, next) {
            Ok(_) => {}
            Err(ContextError::Rejected { endpoint }) => {
                debug!(endpoint = %endpoint, "context destroyed, stopping health checks");
            }
            Err(e) => error!(error = %e, "stopping health checks"),
        }
    }

    async fn probe_once(&self) -> Result<(), CheckerError> {
        let endpoint = self.ctx.endpoint();
        let authority = endpoint.authority();
        let address = endpoint
            .with_port(endpoint.port_or(self.ctx.protocol().default_port()))
            .authority();

        let stream = match timeout(self.timeout, TcpStream::connect(address.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(CheckerError::Probe(format!("connection failed: {}", e))),
            Err(_) => return Err(CheckerError::Probe("connection timeout".to_string())),
        };

        match &self.probe {
            Probe::Tcp => Ok(()),
            Probe::Http {
                path,
                expected_status,
            } => match timeout(
                self.timeout,
                http_probe(stream, &authority, path, *expected_status),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CheckerError::Probe("response timeout".to_string())),
            },
        }
    }
}

/// Send `HEAD path` over `stream` and compare the response status.
async fn http_probe(
    stream: TcpStream,
    authority: &str,
    path: &str,
    expected_status: u16,
) -> Result<(), CheckerError> {
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| CheckerError::Probe(format!("handshake failed: {}", e)))?;

    // Drive the connection; it ends when the sender is dropped
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "health check connection error");
        }
    });

    let request = Request::head(path)
        .header(HOST, authority)
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())
        .map_err(|e| CheckerError::Probe(format!("invalid request: {}", e)))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| CheckerError::Probe(format!("request failed: {}", e)))?;

    let status = response.status().as_u16();
    if status == expected_status {
        Ok(())
    } else {
        Err(CheckerError::Probe(format!(
            "unexpected status: {} (expected {})",
            status, expected_status
        )))
    }
}

/// Handle returned to the group; closing it stops the probe loop.
struct ProbeHandle {
    state: Arc<ProbeState>,
}

impl HealthChecker for ProbeHandle {
    fn close(&self) -> BoxFuture<'static, Result<(), CheckerError>> {
        self.state.closed.store(true, Ordering::Release);
        future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::endpoint::{Endpoint, SessionProtocol};
    use std::sync::Weak;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::runtime::Handle;

    fn context(endpoint: Endpoint, backoff: Arc<dyn Backoff>) -> Arc<HealthCheckerContext> {
        HealthCheckerContext::new(
            endpoint,
            SessionProtocol::Http,
            None,
            backoff,
            Handle::current(),
            Weak::new(),
        )
    }

    fn state(endpoint: Endpoint, probe: Probe, timeout: Duration) -> ProbeState {
        ProbeState {
            ctx: context(endpoint, <dyn Backoff>::fixed(50)),
            probe,
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Serves one fixed HTTP status on every connection.
    async fn http_server(status_line: &'static str) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        Endpoint::of("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_tcp_probe_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let probe = state(Endpoint::of("127.0.0.1", port), Probe::Tcp, Duration::from_secs(5));
        assert!(probe.probe_once().await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        let probe = state(Endpoint::of("127.0.0.1", 1), Probe::Tcp, Duration::from_secs(1));
        assert!(probe.probe_once().await.is_err());
    }

    #[tokio::test]
    async fn test_http_probe_timeout() {
        // Accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                open.push(stream);
            }
        });

        let probe = state(
            Endpoint::of("127.0.0.1", port),
            Probe::http("/health"),
            Duration::from_millis(100),
        );
        let err = probe.probe_once().await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_http_probe_expected_status() {
        let endpoint = http_server("HTTP/1.1 200 OK").await;
        let probe = state(endpoint, Probe::http("/health"), Duration::from_secs(5));
        assert!(probe.probe_once().await.is_ok());
    }

    #[tokio::test]
    async fn test_http_probe_unexpected_status() {
        let endpoint = http_server("HTTP/1.1 503 Service Unavailable").await;
        let probe = state(endpoint, Probe::http("/health"), Duration::from_secs(5));
        let err = probe.probe_once().await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_checker_reschedules_until_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let _ = tx.send(());
                drop(stream);
            }
        });

        let ctx = context(Endpoint::of("127.0.0.1", port), <dyn Backoff>::fixed(20));
        let factory = ProbeCheckerFactory::new(Probe::Tcp, Duration::from_secs(1));
        let handle = factory.create(Arc::clone(&ctx));

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(ctx.has_reported());

        handle.close().await.unwrap();
        // At most one probe already in flight
        tokio::time::sleep(Duration::from_millis(100)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_checker_stops_on_negative_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let ctx = context(Endpoint::of("127.0.0.1", port), <dyn Backoff>::fixed(-1));
        let factory = ProbeCheckerFactory::new(Probe::Tcp, Duration::from_secs(1));
        let _handle = factory.create(Arc::clone(&ctx));

        tokio::time::timeout(Duration::from_secs(5), ctx.initial_check())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.pending_tasks(), 0);
    }
}
