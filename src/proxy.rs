use crate::error::{json_error_response, ProxyErrorCode};
use crate::manager::InstanceManager;
use crate::pool::ConnectionPool;
use crate::tenant::TenantResolver;
use futures::FutureExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header carrying the resolved tenant to the backend
const X_TENANT_ID: &str = "x-tenant-id";

/// Everything a request handler needs, shared by all connections
struct Dispatcher {
    manager: Arc<InstanceManager>,
    resolver: TenantResolver,
    pool: Arc<ConnectionPool>,
    request_timeout: Option<Duration>,
}

/// The front-facing reverse proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    manager: Arc<InstanceManager>,
    resolver: TenantResolver,
    pool: Arc<ConnectionPool>,
    shutdown_rx: watch::Receiver<bool>,
    request_timeout: Option<Duration>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<InstanceManager>,
        resolver: TenantResolver,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            resolver,
            pool,
            shutdown_rx,
            request_timeout: None,
        }
    }

    /// Bound the time spent relaying a single request
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            min_host_labels = self.resolver.min_labels(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let dispatcher = Arc::new(Dispatcher {
            manager: self.manager,
            resolver: self.resolver,
            pool: self.pool,
            request_timeout: self.request_timeout,
        });
        let mut shutdown_rx = self.shutdown_rx;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, dispatcher).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            // A panic must only cost this request, not the connection task or the listener
            let response = match AssertUnwindSafe(handle_request(req, dispatcher, addr))
                .catch_unwind()
                .await
            {
                Ok(response) => response,
                Err(panic) => {
                    error!(
                        client = %addr,
                        panic = panic_message(panic.as_ref()),
                        "Request handler panicked"
                    );
                    json_error_response(ProxyErrorCode::InternalError, "Internal proxy error")
                }
            };
            Ok::<_, hyper::Error>(response)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // HTTP/2 clients send :authority instead of Host
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()));

    let tenant = match dispatcher.resolver.resolve(host) {
        Ok(tenant) => tenant,
        Err(e) => {
            debug!(request_id, error = %e, "Rejecting request without tenant");
            return json_error_response(
                ProxyErrorCode::InvalidTenant,
                "Host header does not identify a tenant",
            );
        }
    };

    // Overwrite rather than append: this proxy is the first trusted hop
    let original_host = host.and_then(|h| HeaderValue::from_str(h).ok());
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(tenant.as_str()) {
        headers.insert(X_TENANT_ID, value);
    }

    debug!(tenant = %tenant, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let instance = match dispatcher.manager.get_or_create(&tenant).await {
        Ok(instance) => instance,
        Err(e) => {
            // Log detailed error internally, return generic message externally
            error!(tenant = %tenant, request_id, error = %e, "Failed to provision instance");
            return json_error_response(ProxyErrorCode::BackendStartFailed, "Backend unavailable");
        }
    };

    let port = instance.port();
    let relay = dispatcher.pool.send_request(req, port);

    let result = match dispatcher.request_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, relay).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    tenant = %tenant,
                    port,
                    request_id,
                    timeout_secs = timeout.as_secs(),
                    "Request timed out"
                );
                return json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", timeout.as_secs()),
                );
            }
        },
        None => relay.await,
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            error!(tenant = %tenant, port, request_id, error = %e, "Failed to relay request");
            json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to reach backend")
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
