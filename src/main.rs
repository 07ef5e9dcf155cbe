use bootgate::config::Config;
use bootgate::handler::InvocationHandler;
use bootgate::server::InvokeServer;
use bootgate::startup::{ProcessLauncher, StartupCoordinator};
use bootgate::{PKG_NAME, VERSION};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bootgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("bootgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let bind_ip: IpAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;
    let bind_addr = SocketAddr::new(bind_ip, config.server.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let launcher = Arc::new(ProcessLauncher::new(config.backend.clone()));
    let coordinator = StartupCoordinator::new(launcher, shutdown_rx.clone());

    // Cold start: get the backend booting before the first invocation arrives
    if config.backend.start_on_boot {
        coordinator.ensure_started();
    }

    let handler = Arc::new(InvocationHandler::from_config(&config, Arc::clone(&coordinator)));
    let server = InvokeServer::new(bind_addr, handler, shutdown_rx);

    let mut server_handle = tokio::spawn(server.run());

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or for the server to die
    let server_error: Option<anyhow::Error>;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        server_error = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                None
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                None
            }
            result = &mut server_handle => server_exit(result),
        };
    }

    #[cfg(not(unix))]
    {
        server_error = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                None
            }
            result = &mut server_handle => server_exit(result),
        };
    }

    let _ = shutdown_tx.send(true);

    // The supervisor needs the grace period plus a little to reap the backend
    let wait = config.backend.shutdown_grace_period() + Duration::from_secs(5);
    let server_running = server_error.is_none();
    let _ = tokio::time::timeout(wait, async {
        if server_running {
            let _ = server_handle.await;
        }
        coordinator.join().await;
    })
    .await;

    if let Some(e) = server_error {
        error!(error = %e, "Invocation server failed, backend stopped");
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Any exit of the server task before shutdown is a failure
fn server_exit(
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> Option<anyhow::Error> {
    match result {
        Ok(Ok(())) => Some(anyhow::anyhow!("Invocation server stopped unexpectedly")),
        Ok(Err(e)) => Some(e),
        Err(e) => Some(anyhow::anyhow!("Invocation server task failed: {}", e)),
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting invocation adapter");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        backend = %config.backend.name,
        command = %config.backend.command,
        config_file = %config.backend.config_file,
        host = %config.backend.host,
        port = config.backend.port,
        start_on_boot = config.backend.start_on_boot,
        "Backend settings"
    );
    info!(
        max_attempts = config.proxy.max_attempts,
        retry_delay_ms = config.proxy.retry_delay_ms,
        connect_timeout_ms = config.proxy.connect_timeout_ms,
        request_timeout_secs = config.proxy.request_timeout_secs,
        "Retry policy"
    );
}
