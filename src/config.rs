use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the adapter
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Local invocation endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// The backend service that gets booted and proxied to
    #[serde(default)]
    pub backend: BackendConfig,

    /// Retry and timeout settings for forwarding
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the invocation endpoint (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the invocation endpoint (default: 9001)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

/// Configuration for the backend process
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// adapter. Configuration files must come from a trusted source.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Service name used in error messages ("<name> not responding")
    #[serde(default = "default_backend_name")]
    pub name: String,

    /// Entry point of the backend
    #[serde(default)]
    pub command: String,

    /// Arguments placed before the configuration file path
    #[serde(default)]
    pub args: Vec<String>,

    /// Configuration file handed to the backend as its last argument
    #[serde(default = "default_config_file")]
    pub config_file: String,

    /// Working directory for the backend
    pub working_dir: Option<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Loopback host the backend listens on
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port the backend listens on
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Trigger the launch as soon as the adapter boots instead of on the first invocation
    #[serde(default = "default_start_on_boot")]
    pub start_on_boot: bool,

    /// Grace period in seconds between SIGTERM and SIGKILL on shutdown
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: default_backend_name(),
            command: String::new(),
            args: Vec::new(),
            config_file: default_config_file(),
            working_dir: None,
            env: HashMap::new(),
            host: default_backend_host(),
            port: default_backend_port(),
            start_on_boot: default_start_on_boot(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl BackendConfig {
    /// Create a backend config for the given entry point with defaults
    pub fn local(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the configuration file path (builder pattern)
    pub fn with_config_file(mut self, path: &str) -> Self {
        self.config_file = path.to_string();
        self
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("backend: 'command' is required".to_string());
        }

        if self.port == 0 {
            errors.push("backend: 'port' must be greater than 0".to_string());
        }

        let loopback = self.host == "localhost"
            || self
                .host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false);
        if !loopback {
            errors.push(format!(
                "backend: 'host' must be a loopback address, got '{}'",
                self.host
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Forwarding behaviour while the backend warms up
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Attempts per invocation before giving up with 503 (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts after a refused connection (default: 500ms)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Connection establishment timeout (default: 2000ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-attempt timeout covering request and response body (default: 10s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    9001
}

fn default_backend_name() -> String {
    "Backend".to_string()
}

fn default_config_file() -> String {
    "traccar.xml".to_string()
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    8082
}

fn default_start_on_boot() -> bool {
    true
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    500
}

fn default_connect_timeout() -> u64 {
    2000 // 2 seconds
}

fn default_request_timeout() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(backend_errors) = self.backend.validate() {
            errors.extend(backend_errors);
        }

        if self.proxy.max_attempts == 0 {
            errors.push("proxy: 'max_attempts' must be at least 1".to_string());
        }

        if self.proxy.connect_timeout_ms == 0 {
            errors.push("proxy: 'connect_timeout_ms' must be greater than 0".to_string());
        }

        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
