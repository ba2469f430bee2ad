//! Configuration module for the gateway service
//!
//! Configuration comes from an optional TOML file plus a handful of
//! environment variables. Upstream URLs are resolved through an injected
//! lookup so the same code path serves both the process environment and tests.

use crate::error::ConfigError;
use crate::routes::{validate_prefix, RouteSpec, RouteTable};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable holding the auth service base URL
pub const AUTH_SERVICE_URL: &str = "AUTH_SERVICE_URL";
/// Environment variable holding the account service base URL
pub const ACCOUNT_SERVICE_URL: &str = "ACCOUNT_SERVICE_URL";

const HOST_ENV: &str = "GATEWAY_HOST";
const PORT_ENV: &str = "GATEWAY_PORT";
const TIMEOUT_ENV: &str = "GATEWAY_UPSTREAM_TIMEOUT_SECS";

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    /// Route name used in logs and metrics (defaults to the prefix)
    #[serde(default)]
    pub name: Option<String>,
    /// Public path prefix (e.g., "/identity-cell/auth")
    pub prefix: String,
    /// Internal prefix substituted for the public one (e.g., "/api/v1/auth")
    #[serde(default)]
    pub rewrite_prefix: String,
    /// Literal upstream base URL
    #[serde(default)]
    pub upstream: Option<String>,
    /// Name of the environment variable holding the upstream base URL
    #[serde(default)]
    pub upstream_env: Option<String>,
    /// Route description
    #[serde(default)]
    pub description: Option<String>,
}

impl RouteConfig {
    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.prefix.clone())
    }

    /// Resolve the upstream URL, consulting `env` for `upstream_env`
    pub fn resolve_upstream<F>(&self, env: &F) -> Result<String, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match (&self.upstream, &self.upstream_env) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousUpstream {
                route: self.label(),
            }),
            (Some(url), None) => Ok(url.clone()),
            (None, Some(var)) => env(var.as_str())
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar {
                    var: var.clone(),
                    route: self.label(),
                }),
            (None, None) => Err(ConfigError::MissingUpstream {
                route: self.label(),
            }),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream response timeout in seconds
    #[serde(default = "default_timeout")]
    pub upstream_timeout: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream_timeout: default_timeout(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path to expose metrics
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether health endpoints are enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Liveness endpoint
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Readiness endpoint
    #[serde(default = "default_ready_path")]
    pub ready_path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_ready_path() -> String {
    "/ready".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_health_path(),
            ready_path: default_ready_path(),
        }
    }
}

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Route configurations, in priority order for equal-length prefixes
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for GatewayConfig {
    /// The identity-cell routes, with upstreams taken from the environment
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            metrics: MetricsConfig::default(),
            health: HealthConfig::default(),
            routes: vec![
                RouteConfig {
                    name: Some("auth".to_string()),
                    prefix: "/identity-cell/auth".to_string(),
                    rewrite_prefix: "/api/v1/auth".to_string(),
                    upstream: None,
                    upstream_env: Some(AUTH_SERVICE_URL.to_string()),
                    description: Some("Authentication service".to_string()),
                },
                RouteConfig {
                    name: Some("accounts".to_string()),
                    prefix: "/identity-cell/accounts".to_string(),
                    rewrite_prefix: "/api/v1/accounts".to_string(),
                    upstream: None,
                    upstream_env: Some(ACCOUNT_SERVICE_URL.to_string()),
                    description: Some("Account service".to_string()),
                },
            ],
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use the built-in routes, then
    /// apply environment overrides
    pub fn load<P, F>(path: Option<P>, env: &F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEWAY_HOST`, `GATEWAY_PORT` and `GATEWAY_UPSTREAM_TIMEOUT_SECS`
    pub fn apply_env_overrides<F>(&mut self, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = env(HOST_ENV).filter(|h| !h.trim().is_empty()) {
            self.server.host = host;
        }
        if let Some(port) = env(PORT_ENV) {
            self.server.port = parse_env(PORT_ENV, &port)?;
        }
        if let Some(timeout) = env(TIMEOUT_ENV) {
            self.server.upstream_timeout = parse_env(TIMEOUT_ENV, &timeout)?;
        }
        Ok(())
    }

    /// Validate everything that does not depend on the environment
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.upstream_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.upstream_timeout".to_string(),
                value: "0".to_string(),
            });
        }

        let reserved = self.reserved_paths();
        for (i, path) in reserved.iter().enumerate() {
            if !path.starts_with('/') || reserved[..i].contains(path) {
                return Err(ConfigError::InvalidValue {
                    field: "reserved endpoint path".to_string(),
                    value: path.to_string(),
                });
            }
        }

        for route in &self.routes {
            validate_prefix(&route.label(), &route.prefix)?;
            for path in &reserved {
                if collides(&route.prefix, path) {
                    return Err(ConfigError::ReservedPrefix {
                        prefix: route.prefix.clone(),
                        reserved: path.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Paths served by the gateway itself and never proxied
    pub fn reserved_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        if self.metrics.enabled {
            paths.push(self.metrics.path.as_str());
        }
        if self.health.enabled {
            paths.push(self.health.path.as_str());
            paths.push(self.health.ready_path.as_str());
        }
        paths
    }

    /// Resolve upstreams and build the route table
    pub fn route_table<F>(&self, env: &F) -> Result<RouteTable, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let specs = self
            .routes
            .iter()
            .map(|route| -> Result<RouteSpec, ConfigError> {
                let upstream = route.resolve_upstream(env)?;
                let mut spec = RouteSpec::new(&route.prefix, upstream, &route.rewrite_prefix);
                if let Some(name) = &route.name {
                    spec = spec.with_name(name);
                }
                if let Some(description) = &route.description {
                    spec = spec.with_description(description);
                }
                Ok(spec)
            })
            .collect::<Result<Vec<_>, _>>()?;
        RouteTable::build(specs)
    }

    /// Get server address, bracketing IPv6 literals
    pub fn server_addr(&self) -> String {
        let host = self.server.host.as_str();
        if host.parse::<std::net::Ipv6Addr>().is_ok() {
            format!("[{}]:{}", host, self.server.port)
        } else {
            format!("{}:{}", host, self.server.port)
        }
    }

    /// Upstream response timeout
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.server.upstream_timeout)
    }

    /// Render a commented sample configuration file
    pub fn sample() -> String {
        format!(
            r#"# Identity Gateway Configuration

[server]
host = "0.0.0.0"
port = 8080
# Seconds to wait for upstream response headers
upstream_timeout = 30

[metrics]
enabled = true
path = "/metrics"

[health]
enabled = true
path = "/health"
ready_path = "/ready"

# Longest matching prefix wins; the prefix is replaced by rewrite_prefix.
[[routes]]
name = "auth"
prefix = "/identity-cell/auth"
rewrite_prefix = "/api/v1/auth"
upstream_env = "{}"
description = "Authentication service"

[[routes]]
name = "accounts"
prefix = "/identity-cell/accounts"
rewrite_prefix = "/api/v1/accounts"
upstream_env = "{}"
# upstream = "http://accounts:9001"
description = "Account service"
"#,
            AUTH_SERVICE_URL, ACCOUNT_SERVICE_URL
        )
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: var.to_string(),
        value: value.to_string(),
    })
}

/// A prefix collides with a reserved path when it would claim that path
fn collides(prefix: &str, reserved: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    let reserved = reserved.trim_end_matches('/');
    !prefix.is_empty()
        && (reserved == prefix || reserved.starts_with(&format!("{}/", prefix))
            || prefix.starts_with(&format!("{}/", reserved)))
}
