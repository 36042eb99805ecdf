//! # Upstream Balancer
//!
//! The decision core of an HTTP load balancer: which backend receives a
//! request, and whether a backend is eligible at all.
//!
//! ## Features
//!
//! - **Five Policies**: Round robin, weighted round robin, least connections,
//!   weighted least connections and IP hash
//! - **Health Monitoring**: Recurring TCP or HTTP reachability probes with a
//!   stop handle
//! - **Lock-free Hot Path**: Atomic cursors, liveness flags and in-flight
//!   counters; the registry is read through immutable snapshots
//! - **Pluggable Forwarding**: Wire-level relaying is delegated to a
//!   [`Forwarder`]
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌─────────────────────────────┐
//! │ Dispatcher │───▶│        LoadBalancer         │
//! └────────────┘    │  ┌─────────────────┐        │      ┌──────────┐
//!       │           │  │ SelectionEngine │──read──┼────▶│ Backend0 │
//!       ▼           │  └─────────────────┘        │      └──────────┘
//! ┌────────────┐    │  ┌─────────────────┐        │      ┌──────────┐
//! │ Forwarder  │    │  │    Registry     │────────┼────▶│ Backend1 │
//! └────────────┘    │  └─────────────────┘        │      └──────────┘
//!                   └─────────────────────────────┘           ▲
//!                   ┌─────────────────┐  liveness only        │
//!                   │  HealthMonitor  │───────────────────────┘
//!                   └─────────────────┘
//! ```

pub mod backend;
pub mod balancer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod registry;
pub mod strategy;

pub use backend::{Backend, BackendStats, InFlightGuard};
pub use balancer::{BackendSummary, LoadBalancer, LoadBalancerStats};
pub use config::{BackendConfig, ConfigLoader, HashKey, HealthCheckConfig, HealthCheckType, LoadBalancerConfig};
pub use dispatcher::{service_unavailable, Dispatcher, ForwardFuture, Forwarder};
pub use error::{ConfigError, ForwardError, LoadBalancerError, LoadBalancerResult};
pub use health::{
    HealthCheckResult, HealthMonitor, HealthMonitorHandle, HealthStatus, HttpProbe, Probe, ProbeFuture, TcpProbe,
};
pub use registry::{Registry, Snapshot};
pub use strategy::{Policy, SelectionEngine};
