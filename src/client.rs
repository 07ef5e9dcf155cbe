//! Loopback HTTP client with bounded retry while the backend boots
//!
//! A refused connection is the only symptom that reliably means "backend still
//! starting", so it is the only failure that is retried. Anything else (timeouts,
//! resets, malformed responses) fails the invocation immediately.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::response::BackendResponse;
use crate::translate::BackendRequest;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::error::Error as StdError;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Failure of a single send attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Nothing is listening on the backend port yet
    #[error("{0}")]
    Refused(String),
    /// Any other I/O failure, timeout or invalid request
    #[error("{0}")]
    Failed(String),
}

/// One request/response exchange with the backend
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, TransportError>;
}

/// Attempt budget and delay for the send loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: config.retry_delay(),
        }
    }

    pub fn is_retryable(&self, error: &TransportError) -> bool {
        matches!(error, TransportError::Refused(_))
    }
}

/// Counters for forwarding activity
#[derive(Debug, Default)]
pub struct ClientStats {
    attempts: AtomicU64,
    refused: AtomicU64,
    fatal: AtomicU64,
    unreachable: AtomicU64,
    succeeded: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub refused: u64,
    pub fatal: u64,
    pub unreachable: u64,
    pub succeeded: u64,
}

impl ClientStats {
    fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fatal(&self) {
        self.fatal.fetch_add(1, Ordering::Relaxed);
    }

    fn record_unreachable(&self) {
        self.unreachable.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
        }
    }
}

/// hyper-based transport to the loopback backend
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl HttpTransport {
    /// The connect timeout is fixed here and shared by every attempt
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(connect_timeout));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        debug!(
            connect_timeout_ms = connect_timeout.as_millis() as u64,
            request_timeout_ms = request_timeout.as_millis() as u64,
            "Backend client initialized"
        );

        Self {
            client,
            request_timeout,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.connect_timeout(), config.request_timeout())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, TransportError> {
        let http_request = request
            .to_http()
            .map_err(|e| TransportError::Failed(format!("invalid request: {}", e)))?;

        let exchange = async {
            let response = self.client.request(http_request).await.map_err(classify)?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| TransportError::Failed(error_chain(&e)))?
                .to_bytes();

            Ok::<_, TransportError>(BackendResponse {
                status: parts.status.as_u16(),
                headers: parts.headers,
                body,
            })
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Failed(format!(
                "request timed out after {}ms",
                self.request_timeout.as_millis()
            ))),
        }
    }
}

fn classify(err: hyper_util::client::legacy::Error) -> TransportError {
    let message = error_chain(&err);
    if err.is_connect() && is_connection_refused(&err) {
        TransportError::Refused(message)
    } else {
        TransportError::Failed(message)
    }
}

fn is_connection_refused(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Render an error with its sources, e.g. "client error (Connect): tcp connect error: ..."
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        let part = e.to_string();
        if !message.contains(&part) {
            message.push_str(": ");
            message.push_str(&part);
        }
        current = e.source();
    }
    message
}

/// Sends backend requests, retrying refused connections within the policy budget
pub struct ProxyClient<T = HttpTransport> {
    transport: T,
    policy: RetryPolicy,
    stats: Arc<ClientStats>,
}

impl ProxyClient<HttpTransport> {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            HttpTransport::from_config(config),
            RetryPolicy::from_config(config),
        )
    }
}

impl<T: Transport> ProxyClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            stats: Arc::new(ClientStats::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Deliver the request, sequentially, at most `max_attempts` times.
    pub async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, ProxyError> {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.stats.record_attempt();

            match self.transport.send(request).await {
                Ok(response) => {
                    self.stats.record_success();
                    debug!(attempt, status = response.status, "Backend responded");
                    return Ok(response);
                }
                Err(e) if self.policy.is_retryable(&e) => {
                    self.stats.record_refused();
                    debug!(attempt, max_attempts, error = %e, "Backend refused connection");
                    tokio::time::sleep(self.policy.delay).await;
                }
                Err(e) => {
                    self.stats.record_fatal();
                    warn!(attempt, uri = %request.uri, error = %e, "Forwarding failed");
                    return Err(ProxyError::Fatal(e.to_string()));
                }
            }
        }

        self.stats.record_unreachable();
        warn!(
            attempts = max_attempts,
            uri = %request.uri,
            "Backend not reachable within retry budget"
        );
        Err(ProxyError::Unreachable {
            attempts: max_attempts,
        })
    }
}
