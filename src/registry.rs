//! Ordered backend registry.

use super::backend::Backend;
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable view of the registry at one point in time.
pub type Snapshot = Arc<[Arc<Backend>]>;

/// An ordered collection of backends.
///
/// Readers take a cheap snapshot (an `Arc` clone) and iterate it without
/// holding any lock, so selection never waits on registration or on a
/// health-check cycle. Registration copies the sequence and swaps it in.
#[derive(Debug)]
pub struct Registry {
    backends: RwLock<Snapshot>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Append a backend, preserving insertion order.
    pub fn push(&self, backend: Arc<Backend>) {
        let mut backends = self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut next = Vec::with_capacity(backends.len() + 1);
        next.extend(backends.iter().cloned());
        next.push(backend);
        *backends = Arc::from(next);
    }

    /// Get the current ordered sequence of backends.
    #[must_use]
    pub fn list(&self) -> Snapshot {
        Arc::clone(&self.backends.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Get the number of registered backends.
    #[must_use]
    pub fn count(&self) -> usize {
        self.list().len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Find a backend by URL or probe address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<Arc<Backend>> {
        self.list()
            .iter()
            .find(|b| b.address() == address || b.url() == address)
            .cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
