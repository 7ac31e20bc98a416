//! Configuration module for hexlisten.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// What the acceptor does when `accept` itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AcceptErrorPolicy {
    /// Log the failure and keep listening.
    #[default]
    Continue,
    /// Stop the server with an error.
    Fatal,
}

/// Command-line arguments for the listener
#[derive(Parser, Debug, Default)]
#[command(name = "hexlisten")]
#[command(version)]
#[command(about = "Accepts TCP connections and logs received bytes as text and hex", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum simultaneous connections (also the listen backlog)
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Behavior when accepting a connection fails
    #[arg(long, value_enum)]
    pub accept_errors: Option<AcceptErrorPolicy>,

    /// Seconds to wait for connection workers during shutdown
    #[arg(long)]
    pub drain_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub accept_errors: AcceptErrorPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            accept_errors: AcceptErrorPolicy::default(),
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
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

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    10
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub max_connections: usize,
    pub accept_errors: AcceptErrorPolicy,
    pub drain_timeout_secs: u64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_parts(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config::from_parts(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML values.
    pub fn from_parts(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            accept_errors: cli
                .accept_errors
                .unwrap_or(toml_config.server.accept_errors),
            drain_timeout_secs: cli
                .drain_timeout
                .unwrap_or(toml_config.shutdown.drain_timeout_secs),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    ZeroCapacity,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ZeroCapacity => write!(f, "max_connections must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}
