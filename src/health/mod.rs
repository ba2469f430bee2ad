//! Health check module
//!
//! Liveness reports that the process is up; readiness flips to unhealthy once
//! shutdown has begun so load balancers stop sending new traffic.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    /// Number of configured routes
    pub routes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health checker service
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Instant,
    ready: Arc<AtomicBool>,
    version: String,
    routes: usize,
}

impl HealthChecker {
    /// Create a new health checker for a gateway serving `routes` routes
    pub fn new(routes: usize) -> Self {
        Self {
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(true)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            routes,
        }
    }

    /// Get liveness status (always healthy if the service is running)
    pub fn liveness(&self) -> HealthResponse {
        self.response(HealthStatus::Healthy, None)
    }

    /// Get readiness status
    pub fn readiness(&self) -> HealthResponse {
        if self.is_ready() {
            self.response(HealthStatus::Healthy, None)
        } else {
            self.response(
                HealthStatus::Unhealthy,
                Some("Gateway is shutting down".to_string()),
            )
        }
    }

    /// Set the readiness status
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn response(&self, status: HealthStatus, message: Option<String>) -> HealthResponse {
        HealthResponse {
            status,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            routes: self.routes,
            message,
        }
    }
}
