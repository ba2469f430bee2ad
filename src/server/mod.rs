//! HTTP server setup
//!
//! The metrics and health endpoints are registered as explicit routes, so
//! axum resolves them before the proxy fallback and they are never forwarded.

use crate::config::GatewayConfig;
use crate::health::{HealthChecker, HealthStatus};
use crate::metrics::{GatewayMetrics, UNMATCHED_ROUTE};
use crate::proxy::Forwarder;
use crate::routes::{MatchResult, RouteTable};
use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub table: Arc<RouteTable>,
    pub forwarder: Arc<Forwarder>,
    pub metrics: Arc<GatewayMetrics>,
    pub health: Arc<HealthChecker>,
}

impl AppState {
    /// Resolve upstreams and build everything the request path needs.
    ///
    /// Any configuration error surfaces here, before a listener exists.
    pub fn from_config<F>(config: &GatewayConfig, env: &F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let table = config.route_table(env)?;
        let metrics = GatewayMetrics::new()?;
        let health = HealthChecker::new(table.len());
        let forwarder = Forwarder::new(config.upstream_timeout());

        Ok(Self {
            table: Arc::new(table),
            forwarder: Arc::new(forwarder),
            metrics: Arc::new(metrics),
            health: Arc::new(health),
        })
    }
}

/// Build the axum router: side-channel endpoints first, everything else proxied
pub fn build_router(config: &GatewayConfig, state: AppState) -> Router {
    let mut router: Router<AppState> = Router::new();

    if config.health.enabled {
        router = router
            .route(&config.health.path, get(health_handler))
            .route(&config.health.ready_path, get(readiness_handler));
    }
    if config.metrics.enabled {
        router = router.route(&config.metrics.path, get(metrics_handler));
    }

    router
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests
pub async fn serve<S>(
    listener: TcpListener,
    router: Router,
    health: Arc<HealthChecker>,
    shutdown: S,
) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(address = %addr, "Gateway listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            health.set_ready(false);
            info!("Shutdown signal received, draining connections");
        })
        .await?;

    info!("Gateway stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Liveness handler
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health.liveness()))
}

/// Readiness handler
async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.readiness();
    let status = if health.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// Metrics handler
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.prometheus_output() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            output,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Proxy handler - matches the path and forwards to the upstream
async fn proxy_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let matched = match state.table.match_path(&path_and_query) {
        MatchResult::Matched(matched) => matched,
        MatchResult::NoMatch => {
            debug!(method = %method, path = req.uri().path(), "No matching route");
            state
                .metrics
                .record_request(&method, UNMATCHED_ROUTE, 404, start.elapsed());
            return (StatusCode::NOT_FOUND, "No matching route found").into_response();
        }
    };

    let route = matched.rule.name();
    let _in_flight = state.metrics.track_in_flight(route);

    match state.forwarder.forward(&matched, req).await {
        Ok(response) => {
            state
                .metrics
                .record_request(&method, route, response.status().as_u16(), start.elapsed());
            response
        }
        Err(err) => {
            state.metrics.record_upstream_error(route, err.kind());
            state
                .metrics
                .record_request(&method, route, err.status().as_u16(), start.elapsed());
            err.into_response()
        }
    }
}
