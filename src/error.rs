//! Error classification and failure responses
//!
//! Forwarding failures end up as plain-text invocation responses (never base64),
//! so an error payload can be told apart from a proxied one at a glance.
//! Failures of the local invocation endpoint itself are JSON.

use crate::event::OutboundResponse;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;

/// Header carrying the error code on failure responses
pub const X_PROXY_ERROR: &str = "X-Proxy-Error";

/// Error codes for adapter errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Backend refused every attempt within the retry budget
    BackendUnreachable,
    /// Non-retryable failure while forwarding
    ForwardingFailed,
    /// Invocation payload is not a JSON event
    InvalidEvent,
    /// Unknown endpoint on the invocation server
    NotFound,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BackendUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ForwardingFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InvalidEvent => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ErrorCode::ForwardingFailed => "FORWARDING_FAILED",
            ErrorCode::InvalidEvent => "INVALID_EVENT",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

/// Terminal failure of a proxied invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    /// Every attempt saw a refused connection
    #[error("backend unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },
    /// Any other transport failure; never retried
    #[error("{0}")]
    Fatal(String),
}

impl ProxyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProxyError::Unreachable { .. } => ErrorCode::BackendUnreachable,
            ProxyError::Fatal(_) => ErrorCode::ForwardingFailed,
        }
    }

    /// Map this failure onto its invocation response
    pub fn to_response(&self, service: &str) -> OutboundResponse {
        match self {
            ProxyError::Unreachable { .. } => unreachable(service),
            ProxyError::Fatal(message) => fatal(message),
        }
    }
}

/// 503 response for a backend that never accepted a connection
pub fn unreachable(service: &str) -> OutboundResponse {
    plain_text(
        ErrorCode::BackendUnreachable,
        format!("{} not responding", service),
    )
}

/// 500 response for a non-retryable forwarding failure
pub fn fatal(message: &str) -> OutboundResponse {
    plain_text(
        ErrorCode::ForwardingFailed,
        format!("Error forwarding request: {}", message),
    )
}

fn plain_text(code: ErrorCode, body: String) -> OutboundResponse {
    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());
    headers.insert(X_PROXY_ERROR.to_string(), code.as_header_value().to_string());

    OutboundResponse {
        status_code: code.status_code().as_u16(),
        headers,
        body,
        is_base64_encoded: false,
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
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
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
