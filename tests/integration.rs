//! Integration tests for Bootgate
//!
//! Backends here are hand-written HTTP/1.1 servers on loopback, so every byte
//! the adapter sends and receives is visible to the assertions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bootgate::client::{HttpTransport, ProxyClient, RetryPolicy};
use bootgate::config::Config;
use bootgate::event::{InboundEvent, OutboundResponse};
use bootgate::handler::InvocationHandler;
use bootgate::server::InvokeServer;
use bootgate::startup::{BackendLauncher, StartupCoordinator, StartupState};
use bootgate::translate::BackendTarget;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Reserve an ephemeral port with nothing listening on it
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one HTTP/1.1 request (head plus Content-Length body)
async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + len {
                return buf;
            }
        }
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return buf;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn raw_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// Serve a canned response on `listener`, recording each raw request
fn serve_canned(listener: TcpListener, response: Vec<u8>) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let request = read_request(&mut stream).await;
            recorded.lock().push(request);
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    });
    requests
}

async fn canned_backend(response: Vec<u8>) -> (u16, Arc<Mutex<Vec<Vec<u8>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (port, serve_canned(listener, response))
}

/// Stands in for a slow-booting backend: binds its port only after `delay`
struct DelayedBackend {
    port: u16,
    delay: Duration,
    response: Vec<u8>,
    launches: Mutex<u32>,
}

#[async_trait]
impl BackendLauncher for DelayedBackend {
    async fn launch(&self, _shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        *self.launches.lock() += 1;
        tokio::time::sleep(self.delay).await;
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await?;
        serve_canned(listener, self.response.clone());
        Ok(())
    }
}

/// Launcher for backends that are already up (or never come up)
struct NoopLauncher;

#[async_trait]
impl BackendLauncher for NoopLauncher {
    async fn launch(&self, _shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn handler_for(
    launcher: Arc<dyn BackendLauncher>,
    port: u16,
    policy: RetryPolicy,
    request_timeout: Duration,
) -> InvocationHandler<HttpTransport> {
    let (_tx, rx) = watch::channel(false);
    let coordinator = StartupCoordinator::new(launcher, rx);
    InvocationHandler::new(
        coordinator,
        BackendTarget::new("127.0.0.1", port),
        ProxyClient::new(
            HttpTransport::new(Duration::from_secs(2), request_timeout),
            policy,
        ),
        "Traccar",
    )
}

fn policy(max_attempts: u32, delay_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        delay: Duration::from_millis(delay_ms),
    }
}

// ============================================================================
// Forwarding scenarios
// ============================================================================

#[tokio::test]
async fn test_cold_start_then_success() {
    let port = free_port().await;
    let launcher = Arc::new(DelayedBackend {
        port,
        delay: Duration::from_millis(300),
        response: raw_response("200 OK", "text/plain", b"OK"),
        launches: Mutex::new(0),
    });
    let handler = handler_for(
        launcher.clone(),
        port,
        policy(5, 200),
        Duration::from_secs(10),
    );

    let event = InboundEvent::new("GET", "/").with_header("User-Agent", "test");
    let response = handler.handle(event).await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "T0s=");
    assert!(response.is_base64_encoded);

    let stats = handler.client().stats().snapshot();
    assert!(stats.refused >= 1, "first attempt should hit a cold backend");
    assert_eq!(stats.succeeded, 1);
    assert_eq!(*launcher.launches.lock(), 1);
}

#[tokio::test]
async fn test_backend_never_comes_up() {
    let port = free_port().await;
    let handler = handler_for(Arc::new(NoopLauncher), port, policy(5, 20), Duration::from_secs(10));

    let started = Instant::now();
    let response = handler.handle(InboundEvent::new("GET", "/api/server")).await;

    assert_eq!(response.status_code, 503);
    assert_eq!(response.body, "Traccar not responding");
    assert!(!response.is_base64_encoded);
    assert_eq!(response.headers.get("Content-Type").unwrap(), "text/plain");

    let stats = handler.client().stats().snapshot();
    assert_eq!(stats.attempts, 5);
    assert_eq!(stats.refused, 5);
    assert_eq!(stats.unreachable, 1);
    // One delay after each of the five refusals
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_post_forwards_method_query_content_type_and_body() {
    let (port, requests) =
        canned_backend(raw_response("201 Created", "application/json", b"{\"id\":1}")).await;
    let handler = handler_for(Arc::new(NoopLauncher), port, policy(5, 20), Duration::from_secs(10));

    let event = InboundEvent::new("POST", "/api/devices")
        .with_query("x=1")
        .with_header("Content-Type", "application/json")
        .with_header("Authorization", "Basic Zm9vOmJhcg==")
        .with_body(r#"{"x":1}"#);
    let response = handler.handle(event).await;

    assert_eq!(response.status_code, 201);
    assert_eq!(STANDARD.decode(&response.body).unwrap(), b"{\"id\":1}");
    assert_eq!(
        response.headers.get("content-type").unwrap(),
        "application/json"
    );

    let requests = requests.lock();
    assert_eq!(requests.len(), 1);
    let raw = String::from_utf8_lossy(&requests[0]).to_string();
    let lower = raw.to_lowercase();
    assert!(raw.starts_with("POST /api/devices?x=1 HTTP/1.1\r\n"), "{}", raw);
    assert!(lower.contains("content-type: application/json"));
    assert!(!lower.contains("authorization"));
    assert!(raw.ends_with("\r\n\r\n{\"x\":1}"));
}

#[tokio::test]
async fn test_get_sends_no_body() {
    let (port, requests) = canned_backend(raw_response("200 OK", "text/plain", b"")).await;
    let handler = handler_for(Arc::new(NoopLauncher), port, policy(5, 20), Duration::from_secs(10));

    let event = InboundEvent::new("GET", "/api/session").with_body("ignored");
    let response = handler.handle(event).await;
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "");

    let requests = requests.lock();
    let raw = String::from_utf8_lossy(&requests[0]).to_string();
    assert!(raw.starts_with("GET /api/session HTTP/1.1\r\n"));
    assert!(raw.ends_with("\r\n\r\n"));
    assert!(!raw.contains("ignored"));
}

#[tokio::test]
async fn test_binary_body_survives_round_trip() {
    let bytes: Vec<u8> = (0u8..=255).collect();
    let (port, _) = canned_backend(raw_response("200 OK", "image/png", &bytes)).await;
    let handler = handler_for(Arc::new(NoopLauncher), port, policy(5, 20), Duration::from_secs(10));

    let response = handler.handle(InboundEvent::new("GET", "/logo.png")).await;

    assert_eq!(response.status_code, 200);
    assert!(response.is_base64_encoded);
    assert_eq!(STANDARD.decode(&response.body).unwrap(), bytes);
}

#[tokio::test]
async fn test_backend_error_status_is_not_retried() {
    let (port, requests) =
        canned_backend(raw_response("500 Internal Server Error", "text/plain", b"boom")).await;
    let handler = handler_for(Arc::new(NoopLauncher), port, policy(5, 20), Duration::from_secs(10));

    let response = handler.handle(InboundEvent::new("GET", "/")).await;

    assert_eq!(response.status_code, 500);
    assert!(response.is_base64_encoded);
    assert_eq!(STANDARD.decode(&response.body).unwrap(), b"boom");
    assert_eq!(requests.lock().len(), 1);
}

#[tokio::test]
async fn test_silent_backend_times_out_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            *counter.lock() += 1;
            held.push(stream);
        }
    });

    let handler = handler_for(
        Arc::new(NoopLauncher),
        port,
        policy(5, 20),
        Duration::from_millis(300),
    );

    let response = handler.handle(InboundEvent::new("GET", "/slow")).await;

    assert_eq!(response.status_code, 500);
    assert_eq!(
        response.body,
        "Error forwarding request: request timed out after 300ms"
    );
    assert!(!response.is_base64_encoded);
    assert_eq!(handler.client().stats().snapshot().attempts, 1);
    assert_eq!(*accepted.lock(), 1);
}

#[tokio::test]
async fn test_connection_reset_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = read_request(&mut stream).await;
            drop(stream);
        }
    });

    let handler = handler_for(Arc::new(NoopLauncher), port, policy(5, 20), Duration::from_secs(10));
    let response = handler.handle(InboundEvent::new("GET", "/")).await;

    assert_eq!(response.status_code, 500);
    assert!(response.body.starts_with("Error forwarding request: "));
    assert_eq!(handler.client().stats().snapshot().attempts, 1);
}

#[tokio::test]
async fn test_concurrent_invocations_launch_once() {
    let port = free_port().await;
    let launcher = Arc::new(DelayedBackend {
        port,
        delay: Duration::from_millis(100),
        response: raw_response("200 OK", "text/plain", b"OK"),
        launches: Mutex::new(0),
    });
    let handler = Arc::new(handler_for(
        launcher.clone(),
        port,
        policy(10, 100),
        Duration::from_secs(10),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let handler = Arc::clone(&handler);
        handles.push(tokio::spawn(async move {
            handler.handle(InboundEvent::new("GET", "/")).await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().status_code, 200);
    }
    assert_eq!(*launcher.launches.lock(), 1);
    assert_eq!(handler.coordinator().state(), StartupState::Starting);
}

// ============================================================================
// Invocation server
// ============================================================================

/// Start an invocation server on an ephemeral port
async fn start_server(
    handler: InvocationHandler<HttpTransport>,
) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let server = InvokeServer::new(addr, Arc::new(handler), rx);
    let handle = tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (addr, tx, handle)
}

async fn http_request(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        addr,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn test_server_invoke_endpoint() {
    let (port, _) = canned_backend(raw_response("200 OK", "text/plain", b"OK")).await;
    let handler = handler_for(Arc::new(NoopLauncher), port, policy(5, 20), Duration::from_secs(10));
    let (addr, shutdown, handle) = start_server(handler).await;

    let event = r#"{"rawPath":"/","requestContext":{"http":{"method":"GET"}},"headers":{"user-agent":"test"}}"#;
    let (status, body) = http_request(addr, "POST", "/invoke", event).await;

    assert_eq!(status, 200);
    let outbound: OutboundResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(outbound.status_code, 200);
    assert_eq!(outbound.body, "T0s=");
    assert!(outbound.is_base64_encoded);

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_server_empty_body_is_empty_event() {
    let (port, requests) = canned_backend(raw_response("200 OK", "text/plain", b"")).await;
    let handler = handler_for(Arc::new(NoopLauncher), port, policy(5, 20), Duration::from_secs(10));
    let (addr, _shutdown, _handle) = start_server(handler).await;

    let (status, body) = http_request(addr, "POST", "/invoke", "").await;

    assert_eq!(status, 200);
    let outbound: OutboundResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(outbound.status_code, 200);
    let raw = String::from_utf8_lossy(&requests.lock()[0]).to_string();
    assert!(raw.starts_with("GET / HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_server_unreachable_backend_is_503_payload() {
    let port = free_port().await;
    let handler = handler_for(Arc::new(NoopLauncher), port, policy(2, 10), Duration::from_secs(10));
    let (addr, _shutdown, _handle) = start_server(handler).await;

    let (status, body) = http_request(addr, "POST", "/invoke", "{}").await;

    // The endpoint succeeded; the invocation response carries the 503
    assert_eq!(status, 200);
    let outbound: OutboundResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(outbound.status_code, 503);
    assert_eq!(outbound.body, "Traccar not responding");
    assert!(!outbound.is_base64_encoded);
}

#[tokio::test]
async fn test_server_forwards_event_with_wrongly_typed_fields() {
    let (port, requests) = canned_backend(raw_response("200 OK", "text/plain", b"OK")).await;
    let handler = handler_for(Arc::new(NoopLauncher), port, policy(5, 20), Duration::from_secs(10));
    let (addr, _shutdown, _handle) = start_server(handler).await;

    let event = r#"{"rawPath":42,"isBase64Encoded":"false","headers":{"x-count":1,"x":null}}"#;
    let (status, body) = http_request(addr, "POST", "/invoke", event).await;

    assert_eq!(status, 200);
    let outbound: OutboundResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(outbound.status_code, 200);
    assert_eq!(outbound.body, "T0s=");
    let raw = String::from_utf8_lossy(&requests.lock()[0]).to_string();
    assert!(raw.starts_with("GET / HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_server_bind_failure_is_reported() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap();

    let handler = handler_for(Arc::new(NoopLauncher), 1, policy(1, 1), Duration::from_secs(1));
    let (_tx, rx) = watch::channel(false);
    let server = InvokeServer::new(addr, Arc::new(handler), rx);

    let result = tokio::time::timeout(Duration::from_secs(5), server.run())
        .await
        .expect("run should return instead of serving");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_server_rejects_invalid_event() {
    let handler = handler_for(Arc::new(NoopLauncher), 1, policy(1, 1), Duration::from_secs(1));
    let (addr, _shutdown, _handle) = start_server(handler).await;

    let (status, body) = http_request(addr, "POST", "/invoke", "not json").await;

    assert_eq!(status, 400);
    assert!(body.contains("\"code\":\"INVALID_EVENT\""));
}

#[tokio::test]
async fn test_server_health_and_not_found() {
    let handler = handler_for(Arc::new(NoopLauncher), 1, policy(1, 1), Duration::from_secs(1));
    let (addr, _shutdown, _handle) = start_server(handler).await;

    let (status, body) = http_request(addr, "GET", "/health", "").await;
    assert_eq!(status, 200);
    let health: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["startup"], "not_started");
    assert_eq!(health["attempts"], 0);
    assert_eq!(health["backend"], "Traccar");

    let (status, body) = http_request(addr, "GET", "/nope", "").await;
    assert_eq!(status, 404);
    assert!(body.contains("\"code\":\"NOT_FOUND\""));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_file_drives_handler() {
    let toml = r#"
[server]
port = 9100

[backend]
name = "Traccar"
command = "java"
args = ["-jar", "tracker-server.jar"]
port = 18082

[proxy]
max_attempts = 3
retry_delay_ms = 250
"#;

    let config: Config = toml::from_str(toml).unwrap();
    config.validate().unwrap();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (_tx, rx) = watch::channel(false);
        let coordinator = StartupCoordinator::new(Arc::new(NoopLauncher), rx);
        let handler = InvocationHandler::from_config(&config, coordinator);

        assert_eq!(handler.service_name(), "Traccar");
        assert_eq!(handler.client().policy().max_attempts, 3);
        assert_eq!(
            handler.client().policy().delay,
            Duration::from_millis(250)
        );
    });
}
