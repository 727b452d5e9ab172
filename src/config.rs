//! Configuration for the milter transport server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::runtime::{
    ListenTarget, ListenerConfig, RuntimeType, DEFAULT_BACKLOG, DEFAULT_EVENT_CAPACITY,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT, DEFAULT_READ_BUFFER_SIZE,
};

/// Command-line arguments for the milter transport server
#[derive(Parser, Debug)]
#[command(name = "milter-transport")]
#[command(version)]
#[command(about = "TCP transport for sendmail milter filters", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on (all interfaces)
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9999); overrides PORT
    #[arg(short = 'l', long)]
    pub listen: Option<ListenTarget>,

    /// Scheduling model
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Pending-accept queue length
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Largest accepted inbound frame payload in bytes
    #[arg(long)]
    pub max_frame_len: Option<u32>,

    /// Maximum simultaneously open connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Port or address to bind to
    #[serde(default = "default_listen")]
    pub listen: ListenTarget,
    #[serde(default)]
    pub runtime: RuntimeType,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Readiness events collected per poll (reactor only)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime: RuntimeType::default(),
            backlog: default_backlog(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Resource limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            max_connections: default_max_connections(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> ListenTarget {
    ListenTarget::Port(DEFAULT_PORT)
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub runtime: RuntimeType,
    pub listener: ListenerConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let target = cli
            .listen
            .or(cli.port.map(ListenTarget::Port))
            .unwrap_or(toml_config.server.listen);

        Config {
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            listener: ListenerConfig {
                target,
                backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
                max_frame_len: cli
                    .max_frame_len
                    .unwrap_or(toml_config.limits.max_frame_len),
                max_connections: cli
                    .max_connections
                    .unwrap_or(toml_config.limits.max_connections),
                read_buffer_size: toml_config.limits.read_buffer_size,
                event_capacity: toml_config.server.event_capacity,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}
