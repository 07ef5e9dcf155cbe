//! One-shot startup of the backend service
//!
//! The first call to [`StartupCoordinator::ensure_started`] launches the backend
//! on a detached task; every later call is a no-op. Nobody waits for readiness
//! here: the proxy client finds out by connecting.

use crate::config::BackendConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Startup progress of the backend. There is no `Ready`: readiness is only
/// observed by a successful connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupState {
    /// Launch has not been triggered yet
    NotStarted,
    /// Launch was triggered (the backend may or may not be up)
    Starting,
}

/// Something that runs the backend
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    /// Run the backend until it exits or `shutdown` becomes true
    async fn launch(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()>;
}

/// Process-wide guard that launches the backend at most once
pub struct StartupCoordinator {
    started: AtomicBool,
    launcher: Arc<dyn BackendLauncher>,
    shutdown_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StartupCoordinator {
    /// Returns `Arc<Self>`; the coordinator is shared by every invocation.
    pub fn new(launcher: Arc<dyn BackendLauncher>, shutdown_rx: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            started: AtomicBool::new(false),
            launcher,
            shutdown_rx,
            task: Mutex::new(None),
        })
    }

    /// Trigger the launch if nobody has yet.
    ///
    /// Returns true only for the single call that won the race. Never waits on
    /// the backend and never reports launch failures. Must be called within a
    /// tokio runtime.
    pub fn ensure_started(&self) -> bool {
        if self.started.load(Ordering::Acquire) {
            return false;
        }

        // Held until the handle is stored, so `join` never sees a started
        // coordinator without its task
        let mut task = self.task.lock();
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        info!("Launching backend");

        let launcher = Arc::clone(&self.launcher);
        let shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            match launcher.launch(shutdown).await {
                Ok(()) => debug!("Backend launch task finished"),
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!(error = %message, "Backend startup failed");
                }
            }
        });

        *task = Some(handle);
        true
    }

    pub fn state(&self) -> StartupState {
        if self.started.load(Ordering::Acquire) {
            StartupState::Starting
        } else {
            StartupState::NotStarted
        }
    }

    /// Wait for the launch task to end, e.g. after shutdown was signalled
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Backend launch task panicked");
            }
        }
    }
}

/// Launches the backend as a child process: `command args... config_file`
pub struct ProcessLauncher {
    config: BackendConfig,
}

impl ProcessLauncher {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Build the command; the configuration file is always the last argument
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.arg(&self.config.config_file);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        cmd
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        let mut child = self.command().spawn().map_err(|e| {
            anyhow::anyhow!("Failed to spawn backend '{}': {}", self.config.command, e)
        })?;

        let name = self.config.name.clone();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout", name.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr", name));
        }

        Ok(child)
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn launch(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let name = self.config.name.as_str();
        info!(
            backend = name,
            command = %self.config.command,
            config_file = %self.config.config_file,
            "Starting backend process"
        );

        let mut child = self.spawn()?;
        let pid = child.id().unwrap_or(0);
        info!(backend = name, pid, "Backend process spawned");

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = shutdown_requested(&mut shutdown) => None,
        };

        match exited {
            Some(status) => {
                let status = status?;
                if status.success() {
                    info!(backend = name, pid, ?status, "Backend process exited");
                    Ok(())
                } else {
                    anyhow::bail!("backend '{}' exited with {}", name, status)
                }
            }
            None => {
                stop_child(name, &mut child, self.config.shutdown_grace_period()).await;
                Ok(())
            }
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can ask for shutdown any more
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM, then SIGKILL once the grace period runs out
async fn stop_child(name: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(backend = name, pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(backend = name, ?status, "Backend process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(backend = name, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                backend = name,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

async fn forward_output<R>(reader: R, stream: &'static str, backend: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(backend = %backend, stream, "{}", line);
    }
}
