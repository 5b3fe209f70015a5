//! Connection pool for backend HTTP connections
//!
//! All traffic to tenant backends (relayed requests and readiness probes) goes
//! through here so keep-alive connections are reused across requests.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Headers that apply to a single connection and must not be forwarded
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Failure talking to a backend
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from the HTTP client (connect refused, reset, ...)
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// The outbound request could not be assembled
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Traffic counters, shared with whoever wants to report them
#[derive(Debug, Default)]
pub struct PoolStats {
    relayed: AtomicU64,
    relay_failures: AtomicU64,
    probes: AtomicU64,
}

impl PoolStats {
    fn record_relay(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_relay_failure(&self) {
        self.relay_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests handed to a backend, successful or not
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    /// Relayed requests that never got a response head
    pub fn relay_failures(&self) -> u64 {
        self.relay_failures.load(Ordering::Relaxed)
    }

    /// Readiness probe requests sent
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

/// Outbound client settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Keep-alive connections kept per backend
    pub max_idle_per_host: usize,
    /// How long an unused keep-alive connection survives
    pub idle_timeout: Duration,
    /// Host the backends listen on
    pub backend_host: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            backend_host: "127.0.0.1".to_string(),
        }
    }
}

/// Shared HTTP clients for reaching tenant backends on loopback ports
pub struct ConnectionPool {
    /// Streams relayed request bodies through unchanged
    client: Client<HttpConnector, Incoming>,
    /// Bodiless GETs for readiness probes
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        // Probes hit backends that are still starting; don't keep those sockets around
        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            backend_host = %config.backend_host,
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Base URL of the backend listening on `port`
    pub fn backend_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.config.backend_host, port)
    }

    /// Relay a request to the backend on `port` and return its response.
    ///
    /// Method, path, query, headers and body are passed through; hop-by-hop
    /// headers are dropped in both directions.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!(
            "{}{}",
            self.backend_url(port),
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        if let Some(request_headers) = builder.headers_mut() {
            *request_headers = headers;
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_relay();

        let response = self.client.request(backend_req).await.map_err(|e| {
            self.stats.record_relay_failure();
            PoolError::from(e)
        })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `path` on the backend and return the response status
    pub async fn get_status(&self, port: u16, path: &str) -> Result<StatusCode, PoolError> {
        let uri = format!("{}{}", self.backend_url(port), path);

        let req = Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_probe();

        let response = self.health_client.request(req).await?;
        Ok(response.status())
    }
}

/// Remove hop-by-hop headers, including any named by the Connection header
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
