use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct HostlinkConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Name used in log output
    #[serde(default = "default_server_name")]
    pub name: String,

    /// IP address or hostname to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on (0 picks a free port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// User name handed to clients in connection info
    #[serde(default = "default_user")]
    pub user: String,

    /// Maximum concurrently handled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TokenConfig {
    /// Token lifetime in seconds
    #[serde(default = "default_token_ttl_seconds")]
    pub ttl_seconds: u64,

    /// How often expired tokens are swept, in seconds
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Upper bound on startup, in milliseconds
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Upper bound on transport shutdown, in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Async error buffer depth
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
}

impl HostlinkConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("hostlink.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("server.name", default_server_name())?
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("server.user", default_user())?
            .set_default("server.max_connections", default_max_connections() as i64)?
            .set_default("tokens.ttl_seconds", default_token_ttl_seconds() as i64)?
            .set_default(
                "tokens.sweep_interval_seconds",
                default_sweep_interval_seconds() as i64,
            )?
            .set_default(
                "lifecycle.startup_timeout_ms",
                default_startup_timeout_ms() as i64,
            )?
            .set_default(
                "lifecycle.shutdown_timeout_ms",
                default_shutdown_timeout_ms() as i64,
            )?
            .set_default(
                "lifecycle.error_channel_capacity",
                default_error_channel_capacity() as i64,
            )?
            .add_source(File::with_name(&path_str).required(false))
            // HOSTLINK__SERVER__PORT=2222 overrides server.port
            .add_source(
                Environment::with_prefix("HOSTLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: HostlinkConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Message(
                "Server name must not be empty".to_string(),
            ));
        }

        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Message(
                "Server host must not be empty".to_string(),
            ));
        }

        if self.server.user.trim().is_empty() {
            return Err(ConfigError::Message(
                "Server user must not be empty".to_string(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(ConfigError::Message(
                "Server max_connections must be greater than 0".to_string(),
            ));
        }

        if self.tokens.ttl_seconds == 0 {
            return Err(ConfigError::Message(
                "Token ttl_seconds must be greater than 0".to_string(),
            ));
        }

        if self.tokens.sweep_interval_seconds == 0 {
            return Err(ConfigError::Message(
                "Token sweep_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.lifecycle.startup_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Lifecycle startup_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.lifecycle.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Lifecycle shutdown_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.lifecycle.error_channel_capacity == 0 {
            return Err(ConfigError::Message(
                "Lifecycle error_channel_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Replace blank and zero values with their defaults. Port 0 is kept.
    pub fn with_defaults_applied(mut self) -> Self {
        if self.server.name.trim().is_empty() {
            self.server.name = default_server_name();
        }
        if self.server.host.trim().is_empty() {
            self.server.host = default_host();
        }
        if self.server.user.trim().is_empty() {
            self.server.user = default_user();
        }
        if self.server.max_connections == 0 {
            self.server.max_connections = default_max_connections();
        }
        if self.tokens.ttl_seconds == 0 {
            self.tokens.ttl_seconds = default_token_ttl_seconds();
        }
        if self.tokens.sweep_interval_seconds == 0 {
            self.tokens.sweep_interval_seconds = default_sweep_interval_seconds();
        }
        if self.lifecycle.startup_timeout_ms == 0 {
            self.lifecycle.startup_timeout_ms = default_startup_timeout_ms();
        }
        if self.lifecycle.shutdown_timeout_ms == 0 {
            self.lifecycle.shutdown_timeout_ms = default_shutdown_timeout_ms();
        }
        if self.lifecycle.error_channel_capacity == 0 {
            self.lifecycle.error_channel_capacity = default_error_channel_capacity();
        }
        self
    }

    /// `host:port` as configured
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl TokenConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl LifecycleConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for HostlinkConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tokens: TokenConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            host: default_host(),
            port: default_port(),
            user: default_user(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_token_ttl_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            error_channel_capacity: default_error_channel_capacity(),
        }
    }
}

// Default value functions
fn default_server_name() -> String {
    "hostlink".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    0
}
fn default_user() -> String {
    "hostlink".to_string()
}
fn default_max_connections() -> usize {
    64
}

fn default_token_ttl_seconds() -> u64 {
    60 * 60
}
fn default_sweep_interval_seconds() -> u64 {
    5 * 60
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}
fn default_error_channel_capacity() -> usize {
    crate::lifecycle::DEFAULT_ERROR_CHANNEL_CAPACITY
}
