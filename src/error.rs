//! Load balancer error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the load balancer.
#[derive(Debug, Error)]
pub enum LoadBalancerError {
    /// Backend address could not be parsed.
    #[error("invalid backend address '{address}': {reason}")]
    InvalidAddress {
        /// The address as supplied by the operator.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Backend not found.
    #[error("backend {0} not found")]
    BackendNotFound(String),

    /// No healthy backends available.
    #[error("no healthy backends available")]
    NoHealthyBackends,

    /// Forwarding to the selected backend failed.
    #[error(transparent)]
    ForwardFailed(#[from] ForwardError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`Forwarder`](crate::dispatcher::Forwarder).
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Could not connect to the upstream.
    #[error("connection to {backend} failed: {reason}")]
    Connect {
        /// Upstream address.
        backend: String,
        /// Underlying failure.
        reason: String,
    },

    /// Upstream did not answer in time.
    #[error("request to {0} timed out")]
    Timeout(String),

    /// Upstream answered but the exchange failed.
    #[error("upstream {backend} failed: {reason}")]
    Upstream {
        /// Upstream address.
        backend: String,
        /// Underlying failure.
        reason: String,
    },
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration file '{path}': {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    /// Failed to parse TOML content.
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Result type for load balancer operations.
pub type LoadBalancerResult<T> = Result<T, LoadBalancerError>;

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
