//! Error types for the gateway
//!
//! Configuration errors are fatal and resolved before the listener opens.
//! Gateway errors are per-request and always map to an HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid or missing routing configuration detected at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("route '{route}' has an empty public prefix")]
    EmptyPrefix { route: String },

    #[error("public prefix '{prefix}' must start with '/'")]
    RelativePrefix { prefix: String },

    #[error("duplicate public prefix '{prefix}'")]
    DuplicatePrefix { prefix: String },

    #[error("public prefix '{prefix}' collides with reserved path '{reserved}'")]
    ReservedPrefix { prefix: String, reserved: String },

    #[error("route '{route}' has no upstream URL")]
    MissingUpstream { route: String },

    #[error("route '{route}' sets both upstream and upstream_env")]
    AmbiguousUpstream { route: String },

    #[error("environment variable '{var}' not set (required by route '{route}')")]
    MissingEnvVar { var: String, route: String },

    #[error("route '{route}' has invalid upstream URL '{url}': {message}")]
    InvalidUpstream {
        route: String,
        url: String,
        message: String,
    },

    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: String, value: String },
}

/// Per-request failure while talking to an upstream
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("upstream {upstream} unavailable: {reason}")]
    UpstreamUnavailable { upstream: String, reason: String },

    #[error("upstream {upstream} did not respond within {timeout:?}")]
    UpstreamTimeout { upstream: String, timeout: Duration },

    #[error("failed to build upstream request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// HTTP status surfaced to the caller
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::UpstreamUnavailable { .. } => "upstream_unavailable",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Internal upstream addresses stay out of the body.
        let message = match self {
            GatewayError::UpstreamUnavailable { .. } => "Upstream service unavailable",
            GatewayError::UpstreamTimeout { .. } => "Upstream service timed out",
            GatewayError::InvalidRequest(_) => "Failed to forward request",
        };
        (self.status(), message).into_response()
    }
}
