//! Load balancer configuration types.

use super::error::{ConfigError, ConfigResult};
use super::strategy::Policy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the load balancer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Load balancing policy identifier (`RR`, `WRR`, `LC`, `WLC`, `IPH`).
    pub method: Policy,

    /// Request attribute hashed by the IP hash policy.
    pub hash_key: HashKey,

    /// Backends, in selection order.
    pub backends: Vec<BackendConfig>,

    /// Health check settings.
    pub health_check: HealthCheckConfig,
}

/// Configuration for a single backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend URL, e.g. `http://10.0.0.1:8080`.
    pub url: String,

    /// Backend weight (for weighted strategies).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl BackendConfig {
    /// Create a backend entry with the default weight.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: default_weight(),
        }
    }

    /// Parse a command-line backend spec: `URL` or `URL=WEIGHT`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the weight is not a
    /// non-negative integer.
    pub fn parse_spec(spec: &str) -> ConfigResult<Self> {
        match spec.rsplit_once('=') {
            Some((url, weight)) => {
                let weight = weight.trim().parse().map_err(|_| {
                    ConfigError::ValidationError(format!("invalid weight in backend '{spec}'"))
                })?;
                Ok(Self {
                    url: url.trim().to_string(),
                    weight,
                })
            },
            None => Ok(Self::new(spec.trim())),
        }
    }
}

/// Request attribute used as the IP hash key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashKey {
    /// The requested host (Host header or URI authority).
    #[default]
    Host,
    /// The client's IP address.
    ClientIp,
    /// The value of a request header.
    Header(String),
}

/// Health check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable periodic health checks.
    pub enabled: bool,

    /// Health check interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Per-probe timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Probe all backends of a cycle concurrently.
    pub concurrent: bool,

    /// Health check type.
    pub check_type: HealthCheckType,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
            concurrent: true,
            check_type: HealthCheckType::default(),
        }
    }
}

/// Type of health check to perform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCheckType {
    /// TCP connection check.
    #[default]
    Tcp,
    /// HTTP health check.
    Http {
        /// Path to check.
        path: String,
        /// Expected status codes; empty accepts any.
        #[serde(default)]
        expected_status: Vec<u16>,
    },
}

fn default_weight() -> u32 {
    1
}

/// Loads and validates [`LoadBalancerConfig`] from TOML.
#[derive(Debug, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Create a new configuration loader.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist
    /// - The file cannot be read
    /// - The TOML is malformed
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(&self, path: P) -> ConfigResult<LoadBalancerConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        self.load_str(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or validation fails.
    pub fn load_str(&self, content: &str) -> ConfigResult<LoadBalancerConfig> {
        let config: LoadBalancerConfig = toml::from_str(content)?;
        self.validate(&config)?;
        Ok(config)
    }

    /// Validate a configuration.
    ///
    /// Backend URLs are only checked for presence here; malformed ones are
    /// rejected individually at registration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] listing every problem found.
    pub fn validate(&self, config: &LoadBalancerConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if config.health_check.enabled {
            if config.health_check.interval.is_zero() {
                errors.push("health_check.interval must be non-zero".to_string());
            }
            if config.health_check.timeout.is_zero() {
                errors.push("health_check.timeout must be non-zero".to_string());
            }
        }

        for (i, backend) in config.backends.iter().enumerate() {
            if backend.url.trim().is_empty() {
                errors.push(format!("backends[{i}].url must not be empty"));
            }
        }

        if let HashKey::Header(name) = &config.hash_key {
            if name.trim().is_empty() {
                errors.push("hash_key header name must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(errors.join("; ")))
        }
    }
}
