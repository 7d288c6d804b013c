//! Configuration module for echo-service.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo service
#[derive(Parser, Debug)]
#[command(name = "echo-service")]
#[command(author = "echo-service authors")]
#[command(version = "0.1.0")]
#[command(about = "A service-managed TCP echo daemon", long_about = None)]
pub struct CliArgs {
    /// Command to run; without one the process runs as the registered service
    /// when no interactive session is attached
    #[arg(value_enum)]
    pub command: Option<Command>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Service name used for registration and dispatch
    #[arg(short, long)]
    pub name: Option<String>,

    /// Address to bind to (e.g., 0.0.0.0:9977)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrently handled connections (unbounded if unset)
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Positional command accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Register the service with the host service manager
    Install,
    /// Remove the service registration
    Remove,
    /// Ask the host service manager to start the service
    Start,
    /// Stop the service and wait for it to reach Stopped
    Stop,
    /// Print the current service status
    Status,
    /// Pause the service and wait for it to reach Paused
    Pause,
    /// Continue a paused service and wait for it to reach Running
    Continue,
    /// Run the service state machine in the foreground
    Debug,
    /// Run only the echo server in the foreground
    Serve,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Service identity
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_description")]
    pub description: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: default_description(),
        }
    }
}

/// Network server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Capacity of the queue between the accept loop and the control loop
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Cap on concurrently handled connections
    pub max_connections: Option<usize>,
    /// Whether the control loop listens for interrupt/terminate signals
    #[serde(default = "default_true")]
    pub watch_signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            queue_capacity: default_queue_capacity(),
            max_connections: None,
            watch_signals: true,
        }
    }
}

/// Heartbeat tick configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Tick period while running, in milliseconds
    #[serde(default = "default_fast_ms")]
    pub fast_ms: u64,
    /// Tick period while paused, in milliseconds
    #[serde(default = "default_slow_ms")]
    pub slow_ms: u64,
    /// Ring the terminal bell on every tick in the foreground runner
    #[serde(default)]
    pub audible: bool,
}

impl HeartbeatConfig {
    pub fn fast(&self) -> Duration {
        Duration::from_millis(self.fast_ms)
    }

    pub fn slow(&self) -> Duration {
        Duration::from_millis(self.slow_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            fast_ms: default_fast_ms(),
            slow_ms: default_slow_ms(),
            audible: false,
        }
    }
}

/// Control-request handling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Pause between the two status reports sent for an interrogate request
    #[serde(default = "default_interrogate_delay_ms")]
    pub interrogate_delay_ms: u64,
    /// How long a stop waits for the server loop before aborting it
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl ControlConfig {
    pub fn interrogate_delay(&self) -> Duration {
        Duration::from_millis(self.interrogate_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            interrogate_delay_ms: default_interrogate_delay_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file; stderr when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_name() -> String {
    "echo-service".to_string()
}

fn default_description() -> String {
    "Timestamped TCP echo service".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:9977".to_string()
}

fn default_queue_capacity() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_fast_ms() -> u64 {
    500
}

fn default_slow_ms() -> u64 {
    2000
}

fn default_interrogate_delay_ms() -> u64 {
    100
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Option<Command>,
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    ///
    /// Exits with status 2 and a usage message on invalid arguments.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Load configuration from an explicit argument list.
    #[cfg(test)]
    pub fn try_load_from<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = CliArgs::try_parse_from(args).map_err(ConfigError::Args)?;
        Self::from_cli(cli)
    }

    /// Merge CLI args with the TOML config (CLI takes precedence).
    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let TomlConfig {
            mut service,
            mut server,
            heartbeat,
            control,
            mut logging,
        } = toml_config;

        if let Some(name) = cli.name {
            service.name = name;
        }
        if let Some(listen) = cli.listen {
            server.listen = listen;
        }
        server.max_connections = cli.max_connections.or(server.max_connections);
        if let Some(level) = cli.log_level {
            logging.level = level;
        }
        logging.file = cli.log_file.or(logging.file);

        if server.queue_capacity == 0 {
            return Err(ConfigError::Invalid("server.queue_capacity must be at least 1"));
        }
        if server.max_connections == Some(0) {
            return Err(ConfigError::Invalid("server.max_connections must be at least 1"));
        }
        if heartbeat.fast_ms == 0 || heartbeat.slow_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat periods must be non-zero"));
        }

        Ok(Config {
            command: cli.command,
            service,
            server,
            heartbeat,
            control,
            logging,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: None,
            service: ServiceConfig::default(),
            server: ServerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Args(clap::Error),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Args(e) => write!(f, "{e}"),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
