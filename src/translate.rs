//! Translation of invocation events into backend-bound HTTP requests

use crate::config::BackendConfig;
use crate::event::InboundEvent;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use std::net::IpAddr;
use tracing::debug;

/// Fixed loopback authority of the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
}

impl BackendTarget {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl From<&BackendConfig> for BackendTarget {
    fn from(config: &BackendConfig) -> Self {
        Self::new(&config.host, config.port)
    }
}

/// Request descriptor for one send attempt against the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    pub method: Method,
    pub uri: String,
    pub content_type: Option<String>,
    /// `None` for GET, otherwise the inbound body (possibly empty)
    pub body: Option<Bytes>,
}

impl BackendRequest {
    /// Build a fresh hyper request; called once per attempt
    pub fn to_http(&self) -> Result<Request<Full<Bytes>>, http::Error> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.as_str());

        if let Some(ref content_type) = self.content_type {
            builder = builder.header(CONTENT_TYPE, content_type.as_str());
        }

        let body = self.body.clone().unwrap_or_default();
        builder.body(Full::new(body))
    }
}

/// Translate an invocation event into a backend request.
///
/// Total over all inputs: missing method falls back to GET, missing path to
/// `/`, an empty query is dropped. Only Content-Type is forwarded.
pub fn translate(event: &InboundEvent, target: &BackendTarget) -> BackendRequest {
    let declared = event.method();
    let method = Method::from_bytes(declared.as_bytes()).unwrap_or_else(|_| {
        debug!(method = declared, "Invalid method in event, using GET");
        Method::GET
    });

    let mut uri = format!("http://{}{}", target.authority(), event.path());
    if let Some(query) = event.query() {
        uri.push('?');
        uri.push_str(query);
    }

    let body = if method.as_str().eq_ignore_ascii_case("GET") {
        None
    } else {
        Some(Bytes::from(event.body.clone().unwrap_or_default()))
    };

    BackendRequest {
        method,
        uri,
        content_type: event.content_type().map(String::from),
        body,
    }
}
