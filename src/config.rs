use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and routing configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How tenant backends are launched and probed
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Minimum number of dot-separated labels in the Host header.
    /// 2 accepts `abc.localhost`, 3 requires `abc.example.com`.
    #[serde(default = "default_min_host_labels")]
    pub min_host_labels: usize,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Upper bound on a single relayed request. Unset means no limit beyond the transport.
    pub request_timeout_secs: Option<u64>,

    /// Terminate all spawned backends when the router shuts down (default: false)
    #[serde(default)]
    pub stop_backends_on_shutdown: bool,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            min_host_labels: default_min_host_labels(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: None,
            stop_backends_on_shutdown: false,
        }
    }
}

/// Configuration shared by every tenant backend
///
/// # Security Warning
///
/// `command` and `args` are executed directly for every new tenant.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Command to execute to start a backend
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the command. `{tenant}` and `{port}` are substituted.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables (PORT and TENANT are always set)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Host the backends listen on, used for probing and forwarding
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Health endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Maximum number of readiness probes before giving up
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    /// Delay between readiness probes in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Timeout for a single readiness probe request in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL when terminating a backend
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl BackendConfig {
    /// Create a backend config for `command` with all other settings defaulted
    pub fn local(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Longest a cold start waits on a backend that never becomes healthy,
    /// counting slow or hanging health checks
    pub fn probe_budget(&self) -> Duration {
        self.probe_interval() * self.probe_attempts
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            host: default_backend_host(),
            health_path: default_health_path(),
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_min_host_labels() -> usize {
    2
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

fn default_probe_attempts() -> u32 {
    100
}

fn default_probe_interval() -> u64 {
    10 // 100 x 10ms, roughly one second per cold start
}

fn default_probe_timeout() -> u64 {
    250
}

fn default_shutdown_grace_period() -> u64 {
    5
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

        if self.server.min_host_labels < 2 {
            errors.push(format!(
                "server.min_host_labels must be at least 2 (got {})",
                self.server.min_host_labels
            ));
        }

        if self.backend.command.trim().is_empty() {
            errors.push("backend.command is required".to_string());
        }

        if self.backend.probe_attempts == 0 {
            errors.push("backend.probe_attempts must be greater than 0".to_string());
        }

        if self.backend.probe_timeout_ms == 0 {
            errors.push("backend.probe_timeout_ms must be greater than 0".to_string());
        }

        if !self.backend.health_path.starts_with('/') {
            errors.push(format!(
                "backend.health_path must start with '/' (got '{}')",
                self.backend.health_path
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
