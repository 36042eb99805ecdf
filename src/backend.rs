//! Backend servers.

use super::error::{LoadBalancerError, LoadBalancerResult};
use http::uri::{Scheme, Uri};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Statistics for a single backend.
#[derive(Debug, Default)]
pub struct BackendStats {
    /// Requests dispatched to this backend.
    pub total_requests: AtomicU64,
    /// Requests whose forwarding failed.
    pub failed_requests: AtomicU64,
}

impl BackendStats {
    /// Create new stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatched request.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed forward.
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total request count.
    #[must_use]
    pub fn total_request_count(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Get failed request count.
    #[must_use]
    pub fn failed_request_count(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// A single upstream server.
///
/// Everything that changes after registration is atomic, so a backend can be
/// shared between request tasks and the health monitor behind an `Arc`
/// without any lock.
#[derive(Debug)]
pub struct Backend {
    /// Base URL requests are forwarded to.
    url: Uri,
    /// `host:port` used for reachability probes.
    address: String,
    /// Weight for weight-aware policies.
    weight: AtomicU32,
    /// Result of the most recent probe.
    alive: AtomicBool,
    /// Requests currently being forwarded.
    in_flight: AtomicI64,
    /// Statistics.
    stats: BackendStats,
}

impl Backend {
    /// Create a backend from an operator-supplied URL.
    ///
    /// Accepts `http://host:port`, `https://host[:port]` or a bare `host:port`
    /// (treated as `http`). The backend starts out dead until it is probed.
    ///
    /// # Errors
    ///
    /// Returns [`LoadBalancerError::InvalidAddress`] if the URL cannot be
    /// parsed, has an unsupported scheme, carries no host, or names a port
    /// outside `1..=65535`.
    pub fn new(url: &str, weight: u32) -> LoadBalancerResult<Self> {
        let invalid = |reason: &str| LoadBalancerError::InvalidAddress {
            address: url.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty address"));
        }

        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };

        let uri: Uri = candidate
            .parse()
            .map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;

        let default_port = match uri.scheme() {
            Some(s) if *s == Scheme::HTTP => 80,
            Some(s) if *s == Scheme::HTTPS => 443,
            Some(s) => return Err(invalid(&format!("unsupported scheme '{s}'"))),
            None => return Err(invalid("missing scheme")),
        };

        let host = match uri.host() {
            Some(h) if !h.is_empty() => h,
            _ => return Err(invalid("missing host")),
        };
        let port = match explicit_port(&uri) {
            None => default_port,
            Some(text) => match text.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(invalid(&format!("invalid port '{text}'"))),
            },
        };
        let address = format!("{host}:{port}");

        Ok(Self {
            url: uri,
            address,
            weight: AtomicU32::new(weight),
            alive: AtomicBool::new(false),
            in_flight: AtomicI64::new(0),
            stats: BackendStats::new(),
        })
    }

    /// Get the backend URL.
    #[must_use]
    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// Get the probe address (`host:port`).
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get the backend weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Set the backend weight.
    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    /// Whether the last probe succeeded.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Record a liveness result.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Get the number of requests currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Mark a request as in flight until the returned guard is dropped.
    ///
    /// The counter can only be decremented through the guard, which keeps it
    /// non-negative under any interleaving.
    #[must_use = "the request is only counted while the guard is alive"]
    pub fn begin_request(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.stats.record_request();
        InFlightGuard { backend: self }
    }

    /// Get backend statistics.
    #[must_use]
    pub fn stats(&self) -> &BackendStats {
        &self.stats
    }
}

/// Port text written after the host, if any.
///
/// `Uri::port` reports an out-of-range port the same as a missing one, so
/// the authority is split by hand.
fn explicit_port(uri: &Uri) -> Option<&str> {
    let authority = uri.authority()?.as_str();
    let host_and_port = authority.rsplit('@').next().unwrap_or(authority);
    let after_host = host_and_port.rfind(']').map_or(0, |i| i + 1);
    host_and_port[after_host..].rsplit_once(':').map(|(_, port)| port)
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Scoped in-flight marker returned by [`Backend::begin_request`].
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    backend: &'a Backend,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let previous = self.backend.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "in-flight counter underflow");
    }
}
