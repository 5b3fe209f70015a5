//! Error types for instance provisioning and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failure of a single instance creation attempt.
///
/// None of these are permanent for the tenant: the next request for the same
/// tenant starts a fresh attempt.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The OS could not hand out an ephemeral port
    #[error("failed to allocate a port: {0}")]
    AllocationFailed(#[source] std::io::Error),

    /// The backend process could not be spawned
    #[error("failed to launch backend for tenant '{tenant}': {reason}")]
    LaunchFailed { tenant: String, reason: String },

    /// The backend did not pass its health check within the probe budget
    #[error("backend on port {port} not ready after {attempts} attempts: {reason}")]
    NotReady {
        port: u16,
        attempts: u32,
        reason: String,
    },
}

impl InstanceError {
    /// Short machine-friendly name, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            InstanceError::AllocationFailed(_) => "allocation_failed",
            InstanceError::LaunchFailed { .. } => "launch_failed",
            InstanceError::NotReady { .. } => "not_ready",
        }
    }
}

/// Machine-readable reason a request was answered by the proxy itself
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Host header missing, malformed, or without a usable tenant label
    InvalidTenant,
    /// Backend could not be provisioned for the tenant
    BackendStartFailed,
    /// The backend did not answer within `request_timeout_secs`
    RequestTimeout,
    /// Failed to relay the request to the backend
    ConnectionFailed,
    /// The request handler panicked
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InvalidTenant => StatusCode::BAD_REQUEST,
            ProxyErrorCode::BackendStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `X-Proxy-Error` header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidTenant => "INVALID_TENANT",
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Body of every proxy-generated error
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Build the JSON error response for `code`
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
