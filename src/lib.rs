//! Identity Gateway - a prefix-routing API gateway
//!
//! This gateway provides:
//! - A static route table mapping public path prefixes to upstream services
//! - Longest-prefix matching with path rewriting
//! - Streaming request/response forwarding with upstream timeouts
//! - Prometheus metrics
//! - Health and readiness checks

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod routes;
pub mod server;

pub use config::GatewayConfig;
pub use error::{ConfigError, GatewayError};
pub use routes::{MatchResult, RouteTable};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
