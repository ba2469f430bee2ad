//! Proxy module for forwarding requests to upstream services
//!
//! This module handles request forwarding, including:
//! - Target URL construction from a matched route
//! - Header rewriting (hop-by-hop removal, `Host` set to the upstream)
//! - Streaming request and response bodies without buffering
//! - Upstream timeout and failure classification
//! - Support for both HTTP and HTTPS upstreams

use crate::error::GatewayError;
use crate::routes::Matched;
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{Request, Response, Uri};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Forwards matched requests to their upstream
///
/// Holds only the pooled client, which is safe to share between concurrent requests.
#[derive(Clone)]
pub struct Forwarder {
    client: UpstreamClient,
    timeout: Duration,
    unavailable_log: Arc<LogThrottle>,
}

impl Forwarder {
    /// Create a forwarder that waits at most `timeout` for upstream response headers.
    ///
    /// The deadline starts when the request is handed to the client, so it also
    /// covers streaming the caller's request body upstream. A slow upload to an
    /// upstream that reads the whole body before replying ends in
    /// [`GatewayError::UpstreamTimeout`]. The response body is not covered.
    pub fn new(timeout: Duration) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new()).build(https);

        Self {
            client,
            timeout,
            unavailable_log: Arc::new(LogThrottle::new(Duration::from_secs(1))),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward a request to the matched rule's upstream and relay the response.
    ///
    /// The returned response streams the upstream body; an error that occurs
    /// after this returns aborts the caller's connection instead of producing a
    /// second status.
    pub async fn forward(
        &self,
        matched: &Matched<'_>,
        req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        let rule = matched.rule;
        let upstream = rule.upstream();
        let target_url = matched.target_url();
        let uri: Uri = target_url
            .parse()
            .map_err(|e| GatewayError::InvalidRequest(format!("{}: {}", target_url, e)))?;

        let (parts, body) = req.into_parts();

        let mut builder = Request::builder().method(parts.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            copy_end_to_end_headers(&parts.headers, headers);
            headers.insert(header::HOST, upstream.host_header().clone());
        }
        let outbound = builder
            .body(body)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        debug!(route = rule.name(), target = %target_url, "Forwarding request");

        // If the caller disconnects, this future is dropped and the pending
        // upstream request is cancelled with it.
        let response = match tokio::time::timeout(self.timeout, self.client.request(outbound)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let err = GatewayError::UpstreamUnavailable {
                    upstream: upstream.base().to_string(),
                    reason: error_chain(&e),
                };
                if let Some(suppressed) = self.unavailable_log.allow() {
                    warn!(route = rule.name(), error = %err, suppressed, "Upstream unavailable");
                }
                return Err(err);
            }
            Err(_) => {
                let err = GatewayError::UpstreamTimeout {
                    upstream: upstream.base().to_string(),
                    timeout: self.timeout,
                };
                warn!(route = rule.name(), error = %err, "Upstream timed out");
                return Err(err);
            }
        };

        let (mut parts, body) = response.into_parts();
        let headers = std::mem::take(&mut parts.headers);
        copy_end_to_end_headers(&headers, &mut parts.headers);

        let route = rule.name().to_string();
        let body = body.map_err(move |e: hyper::Error| {
            warn!(route = %route, error = %e, "Upstream response body aborted");
            e
        });

        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded.
///
/// `host` is included because the outbound `Host` is always recomputed from
/// the upstream URL.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// Copy all end-to-end headers, keeping every value of repeated headers.
///
/// Headers listed in `Connection` are connection-scoped and dropped as well.
fn copy_end_to_end_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    let connection_scoped: Vec<HeaderName> = src
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| token.trim().parse::<HeaderName>().ok())
        .collect();

    for (name, value) in src.iter() {
        if is_hop_by_hop_header(name.as_str()) || connection_scoped.contains(name) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Render an error with its full source chain
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Lets one event through per interval and counts the ones it holds back
pub struct LogThrottle {
    origin: Instant,
    interval_ms: u64,
    next_allowed_ms: AtomicU64,
    suppressed: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval_ms: interval.as_millis() as u64,
            next_allowed_ms: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns the number of events suppressed since the last allowed one,
    /// or `None` if this event should be suppressed
    pub fn allow(&self) -> Option<u64> {
        let now = self.origin.elapsed().as_millis() as u64;
        let next = self.next_allowed_ms.load(Ordering::Relaxed);
        if now >= next
            && self
                .next_allowed_ms
                .compare_exchange(next, now + self.interval_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{MatchResult, RouteSpec, RouteTable};
    use axum::http::{HeaderValue, StatusCode};

    #[test]
    fn test_host_header_is_hop_by_hop() {
        assert!(is_hop_by_hop_header("host"));
        assert!(is_hop_by_hop_header("Host"));
        assert!(is_hop_by_hop_header("HOST"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("authorization"));
        assert!(!is_hop_by_hop_header("content-length"));
    }

    #[test]
    fn test_copy_headers_keeps_repeated_values() {
        let mut src = HeaderMap::new();
        src.append("x-tag", HeaderValue::from_static("a"));
        src.append("x-tag", HeaderValue::from_static("b"));
        src.insert(header::HOST, HeaderValue::from_static("gateway:8080"));
        src.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));

        let mut dst = HeaderMap::new();
        copy_end_to_end_headers(&src, &mut dst);

        let tags: Vec<_> = dst.get_all("x-tag").iter().collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert!(dst.get(header::HOST).is_none());
        assert_eq!(dst.get(header::AUTHORIZATION).unwrap(), "Bearer t");
    }

    #[test]
    fn test_copy_headers_drops_connection_scoped() {
        let mut src = HeaderMap::new();
        src.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        src.insert("x-session-hint", HeaderValue::from_static("1"));
        src.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        src.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut dst = HeaderMap::new();
        copy_end_to_end_headers(&src, &mut dst);

        assert!(dst.get("x-session-hint").is_none());
        assert!(dst.get(header::CONNECTION).is_none());
        assert!(dst.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(dst.get(header::CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_log_throttle() {
        let throttle = LogThrottle::new(Duration::from_millis(50));
        assert_eq!(throttle.allow(), Some(0));
        assert_eq!(throttle.allow(), None);
        assert_eq!(throttle.allow(), None);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(throttle.allow(), Some(2));
        assert_eq!(throttle.allow(), None);
    }

    #[test]
    fn test_error_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let outer = std::io::Error::new(std::io::ErrorKind::Other, inner);
        assert!(error_chain(&outer).contains("refused"));
    }

    fn table_for(upstream: &str) -> RouteTable {
        RouteTable::build(vec![RouteSpec::new(
            "/identity-cell/auth",
            upstream,
            "/api/v1/auth",
        )])
        .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_unavailable() {
        // Reserve a port, then free it so nothing is listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let table = table_for(&format!("http://{}", addr));
        let MatchResult::Matched(matched) = table.match_path("/identity-cell/auth/login") else {
            panic!("expected a match");
        };

        let forwarder = Forwarder::new(Duration::from_secs(5));
        let err = forwarder
            .forward(&matched, get("/identity-cell/auth/login"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let table = table_for(&format!("http://{}", addr));
        let MatchResult::Matched(matched) = table.match_path("/identity-cell/auth") else {
            panic!("expected a match");
        };

        let forwarder = Forwarder::new(Duration::from_millis(200));
        let started = Instant::now();
        let err = forwarder
            .forward(&matched, get("/identity-cell/auth"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTimeout { .. }));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(5));

        hold.abort();
    }
}
