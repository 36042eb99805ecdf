//! The load balancer aggregate.

use super::backend::Backend;
use super::config::{HealthCheckConfig, LoadBalancerConfig};
use super::error::{LoadBalancerError, LoadBalancerResult};
use super::health::{probe_backend, probe_for, HealthMonitor, HealthMonitorHandle, Probe};
use super::registry::{Registry, Snapshot};
use super::strategy::{Policy, SelectionEngine};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Load balancer statistics.
#[derive(Debug, Default)]
pub struct LoadBalancerStats {
    /// Total selections made.
    pub total_selections: AtomicU64,
    /// Successful selections.
    pub successful_selections: AtomicU64,
    /// Failed selections (no eligible backend).
    pub failed_selections: AtomicU64,
}

impl LoadBalancerStats {
    /// Record a selection attempt.
    pub fn record_selection(&self, success: bool) {
        self.total_selections.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_selections.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_selections.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Point-in-time description of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendSummary {
    /// Backend URL.
    pub url: String,
    /// Whether the last probe succeeded.
    pub alive: bool,
    /// Current weight.
    pub weight: u32,
    /// Requests in flight.
    pub in_flight: i64,
}

impl fmt::Display for BackendSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{url: {}, alive: {}, weight: {}, in_flight: {}}}",
            self.url, self.alive, self.weight, self.in_flight
        )
    }
}

/// Load balancer: a policy, an ordered registry and the selection state.
///
/// Shared behind an `Arc` by every request task and the health monitor.
#[derive(Debug)]
pub struct LoadBalancer {
    /// Selection policy.
    method: Policy,
    /// Registered backends.
    registry: Arc<Registry>,
    /// Rotation cursors.
    engine: SelectionEngine,
    /// Reachability check for registration and monitoring.
    probe: Arc<dyn Probe>,
    /// Health check settings.
    health_check: HealthCheckConfig,
    /// Statistics.
    stats: LoadBalancerStats,
}

impl LoadBalancer {
    /// Create an empty load balancer with default health checks.
    #[must_use]
    pub fn new(method: Policy) -> Self {
        let health_check = HealthCheckConfig::default();
        let probe = probe_for(&health_check.check_type);
        Self::with_probe(method, probe, health_check)
    }

    /// Create an empty load balancer with a custom probe.
    #[must_use]
    pub fn with_probe(method: Policy, probe: Arc<dyn Probe>, health_check: HealthCheckConfig) -> Self {
        Self {
            method,
            registry: Arc::new(Registry::new()),
            engine: SelectionEngine::new(),
            probe,
            health_check,
            stats: LoadBalancerStats::default(),
        }
    }

    /// Create a load balancer and register every configured backend.
    ///
    /// Backends with malformed URLs are logged and skipped.
    pub async fn from_config(config: &LoadBalancerConfig) -> Self {
        let probe = probe_for(&config.health_check.check_type);
        let balancer = Self::with_probe(config.method, probe, config.health_check.clone());

        for backend in &config.backends {
            // Already logged by add_backend.
            let _ = balancer.add_backend(&backend.url, backend.weight).await;
        }

        balancer
    }

    /// Get the selection policy.
    #[must_use]
    pub fn method(&self) -> Policy {
        self.method
    }

    /// Register a backend.
    ///
    /// The backend is probed once before it becomes visible, so its initial
    /// liveness is real rather than assumed. With health checks disabled it
    /// is registered alive without probing.
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::InvalidAddress`] if `url` cannot be
    /// parsed. Whether that aborts startup is up to the caller.
    pub async fn add_backend(&self, url: &str, weight: u32) -> LoadBalancerResult<Arc<Backend>> {
        let backend = match Backend::new(url, weight) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(backend = %url, error = %e, "Rejected backend");
                return Err(e);
            },
        };

        if self.health_check.enabled {
            probe_backend(self.probe.as_ref(), &backend, self.health_check.timeout).await;
        } else {
            backend.set_alive(true);
        }

        let backend = Arc::new(backend);
        self.registry.push(Arc::clone(&backend));

        info!(
            backend = %backend.url(),
            weight = backend.weight(),
            alive = backend.is_alive(),
            "Backend added"
        );

        Ok(backend)
    }

    /// Select a backend for a request.
    ///
    /// `key` is the request's hash key, used only by [`Policy::IpHash`].
    /// Returns `None` when no backend is eligible.
    pub fn select_backend(&self, key: &str) -> Option<Arc<Backend>> {
        let backends = self.registry.list();
        let selected = self.engine.select(self.method, &backends, key).cloned();

        self.stats.record_selection(selected.is_some());
        if selected.is_none() {
            debug!(
                policy = %self.method,
                backends = backends.len(),
                "No eligible backend"
            );
        }

        selected
    }

    /// Get the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Get all backends in registry order.
    #[must_use]
    pub fn backends(&self) -> Snapshot {
        self.registry.list()
    }

    /// Get the number of registered backends.
    #[must_use]
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// Describe every backend in registry order.
    #[must_use]
    pub fn describe(&self) -> Vec<BackendSummary> {
        self.registry
            .list()
            .iter()
            .map(|backend| BackendSummary {
                url: backend.url().to_string(),
                alive: backend.is_alive(),
                weight: backend.weight(),
                in_flight: backend.in_flight(),
            })
            .collect()
    }

    /// Change a backend's weight.
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::BackendNotFound`] if no backend matches
    /// `address` (its URL or `host:port`).
    pub fn set_backend_weight(&self, address: &str, weight: u32) -> LoadBalancerResult<()> {
        let backend = self
            .registry
            .get(address)
            .ok_or_else(|| LoadBalancerError::BackendNotFound(address.to_string()))?;

        info!(backend = %backend.url(), from = backend.weight(), to = weight, "Backend weight changed");
        backend.set_weight(weight);
        Ok(())
    }

    /// Get load balancer statistics.
    #[must_use]
    pub fn stats(&self) -> &LoadBalancerStats {
        &self.stats
    }

    /// Spawn the recurring health monitor for this balancer's registry.
    ///
    /// Returns `None` when health checks are disabled.
    #[must_use]
    pub fn start_health_monitor(&self) -> Option<HealthMonitorHandle> {
        if !self.health_check.enabled {
            debug!("Health checks disabled");
            return None;
        }

        info!(
            interval_ms = self.health_check.interval.as_millis(),
            timeout_ms = self.health_check.timeout.as_millis(),
            "Starting health monitor"
        );

        let monitor = HealthMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.probe),
            &self.health_check,
        );
        Some(monitor.spawn())
    }
}
