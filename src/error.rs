//! Error kinds for routing and forwarding, plus JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors produced while routing a request to a backend.
///
/// The type is `Clone` because a failed proxy construction is memoized and
/// handed out to every caller that hits the same cache entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Empty path or empty identifier segment
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Identifier failed the hex-content check
    #[error("wrong hash={0}")]
    InvalidHash(String),
    /// Resolver could not supply or refresh a location
    #[error("location unavailable: {0}")]
    LocationUnavailable(String),
    /// Both dial attempts failed
    #[error("dial failure: {0}")]
    DialFailure(String),
    /// Forwarding failed after the connection was established
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl GatewayError {
    /// Error code used for the HTTP response
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            GatewayError::InvalidRequest(_) => ProxyErrorCode::InvalidRequest,
            GatewayError::InvalidHash(_) => ProxyErrorCode::InvalidHash,
            GatewayError::LocationUnavailable(_) => ProxyErrorCode::LocationUnavailable,
            GatewayError::DialFailure(_) => ProxyErrorCode::DialFailure,
            GatewayError::Upstream(_) => ProxyErrorCode::UpstreamError,
        }
    }

    /// Whether the failure was caused by the client request itself
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidRequest(_) | GatewayError::InvalidHash(_)
        )
    }

    /// Message safe to return to the client. Server-side details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::InvalidHash(_) => self.to_string(),
            GatewayError::LocationUnavailable(_) => "Backend location unavailable".to_string(),
            GatewayError::DialFailure(_) => "Failed to connect to backend".to_string(),
            GatewayError::Upstream(_) => "Backend request failed".to_string(),
        }
    }

    /// Render as a JSON error response
    pub fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.public_message())
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Malformed routing path
    InvalidRequest,
    /// Identifier is not a content hash or configured mod
    InvalidHash,
    /// No backend location could be resolved
    LocationUnavailable,
    /// Backend could not be dialed, even after a refresh
    DialFailure,
    /// Backend connection failed mid-request
    UpstreamError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidHash => StatusCode::BAD_REQUEST,
            ProxyErrorCode::LocationUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::DialFailure => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::InvalidHash => "INVALID_HASH",
            ProxyErrorCode::LocationUnavailable => "LOCATION_UNAVAILABLE",
            ProxyErrorCode::DialFailure => "DIAL_FAILURE",
            ProxyErrorCode::UpstreamError => "UPSTREAM_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
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

    /// Convert to JSON string
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
