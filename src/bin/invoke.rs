//! bootgate-invoke - run a single invocation against a freshly booted backend
//!
//! Usage:
//!   bootgate-invoke [config.toml] [event.json]
//!
//! Without an event file a `GET /` with `User-Agent: test` is sent. The status
//! and the decoded body are printed to stdout.

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bootgate::config::Config;
use bootgate::event::{InboundEvent, OutboundResponse};
use bootgate::handler::InvocationHandler;
use bootgate::startup::{ProcessLauncher, StartupCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bootgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("bootgate.toml"));
    let event_path = args.next().map(PathBuf::from);

    let config = Config::load(&config_path)?;
    let event = match event_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read event {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse event {}", path.display()))?
        }
        None => InboundEvent::new("GET", "/").with_header("User-Agent", "test"),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let launcher = Arc::new(ProcessLauncher::new(config.backend.clone()));
    let coordinator = StartupCoordinator::new(launcher, shutdown_rx);
    let handler = InvocationHandler::from_config(&config, Arc::clone(&coordinator));

    let response = handler.handle(event).await;
    print_response(&response);

    let _ = shutdown_tx.send(true);
    let wait = config.backend.shutdown_grace_period() + std::time::Duration::from_secs(5);
    let _ = tokio::time::timeout(wait, coordinator.join()).await;

    Ok(())
}

fn print_response(response: &OutboundResponse) {
    println!("Status: {}", response.status_code);

    let body = if response.is_base64_encoded {
        match STANDARD.decode(&response.body) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => response.body.clone(),
        }
    } else {
        response.body.clone()
    };
    println!("{}", body);
}
