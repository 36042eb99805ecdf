//! Health monitoring for backend servers.

use super::backend::Backend;
use super::config::{HealthCheckConfig, HealthCheckType};
use super::registry::Registry;
use futures_util::future::join_all;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Boxed future returned by [`Probe`] implementations.
pub type ProbeFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A reachability check against a backend address.
pub trait Probe: Send + Sync + fmt::Debug {
    /// Check `address` once, giving up after `timeout`.
    ///
    /// The error string describes why the backend is considered dead.
    fn check<'a>(&'a self, address: &'a str, timeout: Duration) -> ProbeFuture<'a, Result<(), String>>;

    /// Whether `address` answered within `timeout`.
    fn is_reachable<'a>(&'a self, address: &'a str, timeout: Duration) -> ProbeFuture<'a, bool> {
        Box::pin(async move { self.check(address, timeout).await.is_ok() })
    }
}

/// Probe that succeeds when a TCP connection can be opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl Probe for TcpProbe {
    fn check<'a>(&'a self, address: &'a str, limit: Duration) -> ProbeFuture<'a, Result<(), String>> {
        Box::pin(async move {
            match timeout(limit, TcpStream::connect(address)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(format!("connection failed: {e}")),
                Err(_) => Err("connection timeout".to_string()),
            }
        })
    }
}

/// Probe that issues `GET <path>` and checks the response status.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    /// Path to request.
    path: String,
    /// Accepted status codes; empty accepts any.
    expected_status: Vec<u16>,
}

impl HttpProbe {
    /// Create a new HTTP probe.
    #[must_use]
    pub fn new(path: impl Into<String>, expected_status: Vec<u16>) -> Self {
        Self {
            path: path.into(),
            expected_status,
        }
    }

    async fn request(&self, address: &str, limit: Duration) -> Result<(), String> {
        match timeout(limit, self.exchange(address)).await {
            Ok(outcome) => outcome,
            Err(_) => Err("request timeout".to_string()),
        }
    }

    async fn exchange(&self, address: &str) -> Result<(), String> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| format!("connection failed: {e}"))?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.path, address
        );

        if let Err(e) = stream.write_all(request.as_bytes()).await {
            return Err(format!("failed to send request: {e}"));
        }

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();

        reader
            .read_line(&mut status_line)
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        let status_code: u16 = status_line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| format!("invalid HTTP response: {}", status_line.trim_end()))?
            .parse()
            .map_err(|_| format!("invalid HTTP response: {}", status_line.trim_end()))?;

        if self.expected_status.is_empty() || self.expected_status.contains(&status_code) {
            Ok(())
        } else {
            Err(format!(
                "unexpected status code: {}, expected one of {:?}",
                status_code, self.expected_status
            ))
        }
    }
}

impl Probe for HttpProbe {
    fn check<'a>(&'a self, address: &'a str, limit: Duration) -> ProbeFuture<'a, Result<(), String>> {
        Box::pin(self.request(address, limit))
    }
}

/// Build the probe described by a health check type.
#[must_use]
pub fn probe_for(check_type: &HealthCheckType) -> Arc<dyn Probe> {
    match check_type {
        HealthCheckType::Tcp => Arc::new(TcpProbe),
        HealthCheckType::Http {
            path,
            expected_status,
        } => Arc::new(HttpProbe::new(path.clone(), expected_status.clone())),
    }
}

/// Liveness of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Last probe succeeded.
    Alive,
    /// Last probe failed.
    Dead,
}

/// Result of a health check.
#[derive(Debug)]
pub struct HealthCheckResult {
    /// Backend address.
    pub address: String,
    /// Health status.
    pub status: HealthStatus,
    /// Response time.
    pub response_time: Duration,
    /// Error message if dead.
    pub error: Option<String>,
}

/// Probe one backend and overwrite its liveness with the outcome.
///
/// `limit` bounds the whole check even when the probe ignores it. Failures
/// are logged and recorded, never returned as errors.
pub async fn probe_backend(probe: &dyn Probe, backend: &Backend, limit: Duration) -> HealthCheckResult {
    let address = backend.address();
    let start = Instant::now();
    let outcome = match timeout(limit, probe.check(address, limit)).await {
        Ok(outcome) => outcome,
        Err(_) => Err("probe timeout".to_string()),
    };
    let response_time = start.elapsed();

    let was_alive = backend.is_alive();
    backend.set_alive(outcome.is_ok());

    match outcome {
        Ok(()) => {
            if was_alive {
                debug!(
                    backend = %address,
                    response_time_ms = response_time.as_millis(),
                    "Health check passed"
                );
            } else {
                info!(backend = %address, "Backend is alive");
            }
            HealthCheckResult {
                address: address.to_string(),
                status: HealthStatus::Alive,
                response_time,
                error: None,
            }
        },
        Err(e) => {
            warn!(backend = %address, error = %e, "Health check failed, backend is dead");
            HealthCheckResult {
                address: address.to_string(),
                status: HealthStatus::Dead,
                response_time,
                error: Some(e),
            }
        },
    }
}

/// Recurring liveness checks over a registry.
#[derive(Debug)]
pub struct HealthMonitor {
    /// Backends to check.
    registry: Arc<Registry>,
    /// Reachability check.
    probe: Arc<dyn Probe>,
    /// Time between cycles.
    interval: Duration,
    /// Per-probe timeout.
    timeout: Duration,
    /// Probe all backends at once instead of one after another.
    concurrent: bool,
}

impl HealthMonitor {
    /// Create a new health monitor.
    #[must_use]
    pub fn new(registry: Arc<Registry>, probe: Arc<dyn Probe>, config: &HealthCheckConfig) -> Self {
        Self {
            registry,
            probe,
            interval: config.interval,
            timeout: config.timeout,
            concurrent: config.concurrent,
        }
    }

    /// Probe every registered backend once.
    ///
    /// Backends registered while a cycle is running are picked up by the
    /// next cycle.
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let backends = self.registry.list();
        let probe = self.probe.as_ref();

        if self.concurrent {
            join_all(
                backends
                    .iter()
                    .map(|backend| probe_backend(probe, backend, self.timeout)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(backends.len());
            for backend in backends.iter() {
                results.push(probe_backend(probe, backend, self.timeout).await);
            }
            results
        }
    }

    /// Run health checks every interval until `shutdown` fires or its
    /// sender is dropped.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        debug!(
            interval_ms = self.interval.as_millis(),
            backends = self.registry.count(),
            "Starting health check task"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Health check task shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    let results = self.check_all().await;

                    let healthy = results.iter().filter(|r| r.status == HealthStatus::Alive).count();
                    let total = results.len();

                    debug!(
                        healthy,
                        total,
                        "Health check cycle complete"
                    );
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current Tokio runtime.
    #[must_use = "dropping the handle stops the health monitor"]
    pub fn spawn(self) -> HealthMonitorHandle {
        let (shutdown, receiver) = mpsc::channel(1);
        let task = tokio::spawn(self.run(receiver));
        HealthMonitorHandle { shutdown, task }
    }
}

/// Handle to a spawned [`HealthMonitor`].
#[derive(Debug)]
pub struct HealthMonitorHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl HealthMonitorHandle {
    /// Signal the monitor to stop and wait for it to exit.
    ///
    /// A probe cycle already in progress completes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Health check task ended abnormally");
        }
        info!("Health monitor stopped");
    }

    /// Check whether the monitor task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
