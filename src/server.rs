//! Local invocation endpoint
//!
//! Stands in for the hosting platform: each `POST /invoke` carries one event and
//! gets back the invocation response, both as JSON.

use crate::client::{HttpTransport, Transport};
use crate::error::{json_error_response, ErrorCode};
use crate::event::InboundEvent;
use crate::handler::InvocationHandler;
use crate::{PKG_NAME, VERSION};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

type ServerResponse = Response<BoxBody<Bytes, hyper::Error>>;

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> ServerResponse {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Invocation server
pub struct InvokeServer<T = HttpTransport> {
    bind_addr: SocketAddr,
    handler: Arc<InvocationHandler<T>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport + 'static> InvokeServer<T> {
    pub fn new(
        bind_addr: SocketAddr,
        handler: Arc<InvocationHandler<T>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            handler,
            shutdown_rx,
        }
    }

    /// Bind and serve until shutdown is signalled
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Invocation server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, handler).await {
                                    debug!(addr = %addr, error = %e, "Invocation connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept invocation connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Invocation server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<T: Transport + 'static>(
    stream: tokio::net::TcpStream,
    handler: Arc<InvocationHandler<T>>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        async move { handle_request(req, handler).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Invocation connection error: {}", e))?;

    Ok(())
}

async fn handle_request<T: Transport>(
    req: Request<Incoming>,
    handler: Arc<InvocationHandler<T>>,
) -> Result<ServerResponse, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Invocation server request");

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/invoke") => {
            let body = req.into_body().collect().await?.to_bytes();
            invoke(&body, &handler).await
        }

        (&Method::GET, "/health") => {
            let stats = handler.client().stats().snapshot();
            let health = serde_json::json!({
                "status": "ok",
                "name": PKG_NAME,
                "version": VERSION,
                "backend": handler.service_name(),
                "startup": handler.coordinator().state(),
                "attempts": stats.attempts,
                "refused": stats.refused,
                "fatal": stats.fatal,
                "unreachable": stats.unreachable,
                "succeeded": stats.succeeded,
            });
            json_response(StatusCode::OK, health.to_string())
        }

        _ => json_error_response(
            ErrorCode::NotFound,
            format!("No endpoint for {} {}", method, path),
        ),
    };

    Ok(response)
}

async fn invoke<T: Transport>(body: &[u8], handler: &InvocationHandler<T>) -> ServerResponse {
    let event = match parse_event(body) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "Rejected invocation payload");
            return json_error_response(ErrorCode::InvalidEvent, format!("Invalid event: {}", e));
        }
    };

    let outbound = handler.handle(event).await;

    match serde_json::to_vec(&outbound) {
        Ok(json) => json_response(StatusCode::OK, json),
        Err(e) => json_error_response(ErrorCode::ForwardingFailed, e.to_string()),
    }
}

/// An empty (or whitespace-only) payload is the empty event
pub fn parse_event(body: &[u8]) -> Result<InboundEvent, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(InboundEvent::default());
    }
    serde_json::from_slice(body)
}
