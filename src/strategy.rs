//! Load balancing strategies.

use super::backend::Backend;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Load balancing policy.
///
/// Policies are named on the wire by their short identifiers
/// (`RR`, `WRR`, `LC`, `WLC`, `IPH`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Policy {
    /// Cyclic selection in registry order.
    #[default]
    RoundRobin,
    /// Cyclic selection proportional to weight.
    WeightedRoundRobin,
    /// Fewest in-flight requests.
    LeastConnections,
    /// Lowest in-flight to weight ratio.
    WeightedLeastConnections,
    /// Hash of the request key, for affinity.
    IpHash,
}

impl Policy {
    /// All policies, in identifier order.
    pub const ALL: [Policy; 5] = [
        Policy::RoundRobin,
        Policy::WeightedRoundRobin,
        Policy::LeastConnections,
        Policy::WeightedLeastConnections,
        Policy::IpHash,
    ];

    /// Parse a policy identifier.
    ///
    /// Identifiers are case-insensitive. Anything unrecognized selects
    /// round robin.
    #[must_use]
    pub fn from_identifier(identifier: &str) -> Self {
        match identifier.trim().to_ascii_uppercase().as_str() {
            "RR" => Self::RoundRobin,
            "WRR" => Self::WeightedRoundRobin,
            "LC" => Self::LeastConnections,
            "WLC" => Self::WeightedLeastConnections,
            "IPH" => Self::IpHash,
            other => {
                warn!(policy = %other, "Unknown load balancing policy, using round robin");
                Self::RoundRobin
            },
        }
    }

    /// Get the short identifier.
    #[must_use]
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::RoundRobin => "RR",
            Self::WeightedRoundRobin => "WRR",
            Self::LeastConnections => "LC",
            Self::WeightedLeastConnections => "WLC",
            Self::IpHash => "IPH",
        }
    }

    /// Get the descriptive name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::LeastConnections => "least-connections",
            Self::WeightedLeastConnections => "weighted-least-connections",
            Self::IpHash => "ip-hash",
        }
    }
}

impl From<String> for Policy {
    fn from(identifier: String) -> Self {
        Self::from_identifier(&identifier)
    }
}

impl From<Policy> for String {
    fn from(policy: Policy) -> Self {
        policy.identifier().to_string()
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Picks a backend for a request.
///
/// Holds the rotation cursors shared by every request task. Cursors are
/// advanced with a single atomic add and wrap on overflow; only their value
/// modulo the candidate count matters.
#[derive(Debug, Default)]
pub struct SelectionEngine {
    /// Round-robin rotation.
    cursor: AtomicUsize,
    /// Weighted round-robin rotation.
    weighted_cursor: AtomicUsize,
}

impl SelectionEngine {
    /// Create a new selection engine with both cursors at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a backend with the given policy.
    ///
    /// `key` is only consulted by [`Policy::IpHash`]. Returns `None` when no
    /// backend is eligible.
    pub fn select<'a>(
        &self,
        policy: Policy,
        backends: &'a [Arc<Backend>],
        key: &str,
    ) -> Option<&'a Arc<Backend>> {
        match policy {
            Policy::RoundRobin => self.round_robin(backends),
            Policy::WeightedRoundRobin => self.weighted_round_robin(backends),
            Policy::LeastConnections => least_connections(backends),
            Policy::WeightedLeastConnections => weighted_least_connections(backends),
            Policy::IpHash => self.ip_hash(backends, key),
        }
    }

    /// First alive backend at or after the advanced cursor, wrapping once.
    pub fn round_robin<'a>(&self, backends: &'a [Arc<Backend>]) -> Option<&'a Arc<Backend>> {
        let count = backends.len();
        if count == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % count;

        (0..count)
            .map(|offset| &backends[(start + offset) % count])
            .find(|backend| backend.is_alive())
    }

    /// Walk the cumulative weights of the alive backends.
    ///
    /// Over any `sum(weights)` consecutive selections with stable liveness,
    /// each backend is chosen exactly `weight` times. Degrades to round robin
    /// when every alive backend has weight zero.
    pub fn weighted_round_robin<'a>(
        &self,
        backends: &'a [Arc<Backend>],
    ) -> Option<&'a Arc<Backend>> {
        let weighted: Vec<(&'a Arc<Backend>, u64)> = backends
            .iter()
            .filter(|backend| backend.is_alive())
            .map(|backend| (backend, u64::from(backend.weight())))
            .collect();

        if weighted.is_empty() {
            return None;
        }

        let total_weight: u64 = weighted.iter().map(|&(_, weight)| weight).sum();
        if total_weight == 0 {
            return self.round_robin(backends);
        }

        let tick = self.weighted_cursor.fetch_add(1, Ordering::Relaxed) as u64 % total_weight;
        let mut accumulated = 0u64;

        for &(backend, weight) in &weighted {
            accumulated += weight;
            if tick < accumulated {
                return Some(backend);
            }
        }

        // Unreachable: tick < total_weight == final accumulated.
        weighted.first().map(|&(backend, _)| backend)
    }

    /// Hash the key onto a registry slot.
    ///
    /// A dead slot falls back to round robin, trading affinity for
    /// availability: while the hashed backend is down its clients are spread
    /// over the others, and they return once it is alive again.
    pub fn ip_hash<'a>(&self, backends: &'a [Arc<Backend>], key: &str) -> Option<&'a Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let backend = &backends[hash_index(key, backends.len())];
        if backend.is_alive() {
            Some(backend)
        } else {
            self.round_robin(backends)
        }
    }
}

/// Registry slot for a hash key.
///
/// Stable for the life of the process for a given key and registry size.
#[must_use]
pub fn hash_index(key: &str, count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % count as u64) as usize
}

/// First alive backend with the fewest requests in flight.
pub fn least_connections(backends: &[Arc<Backend>]) -> Option<&Arc<Backend>> {
    let mut best: Option<(&Arc<Backend>, i64)> = None;

    for backend in backends.iter().filter(|backend| backend.is_alive()) {
        let in_flight = backend.in_flight();
        match best {
            Some((_, min)) if in_flight >= min => {},
            _ => best = Some((backend, in_flight)),
        }
    }

    best.map(|(backend, _)| backend)
}

/// First alive backend with the lowest `in_flight / weight`.
///
/// A weight of zero counts as maximally loaded, so such a backend is only
/// picked when every alive backend has weight zero. Among those the one
/// with the fewest requests in flight wins.
pub fn weighted_least_connections(backends: &[Arc<Backend>]) -> Option<&Arc<Backend>> {
    let mut best: Option<(&Arc<Backend>, Load)> = None;

    for backend in backends.iter().filter(|backend| backend.is_alive()) {
        let load = Load {
            in_flight: backend.in_flight(),
            weight: backend.weight(),
        };
        match best {
            Some((_, min)) if load >= min => {},
            _ => best = Some((backend, load)),
        }
    }

    best.map(|(backend, _)| backend)
}

/// In-flight to weight ratio, compared without division.
#[derive(Debug, Clone, Copy)]
struct Load {
    in_flight: i64,
    weight: u32,
}

impl PartialEq for Load {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Load {}

impl PartialOrd for Load {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Load {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match (self.weight, other.weight) {
            (0, 0) => self.in_flight.cmp(&other.in_flight),
            (0, _) => CmpOrdering::Greater,
            (_, 0) => CmpOrdering::Less,
            (a, b) => {
                let lhs = i128::from(self.in_flight) * i128::from(b);
                let rhs = i128::from(other.in_flight) * i128::from(a);
                lhs.cmp(&rhs)
            },
        }
    }
}
