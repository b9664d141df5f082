//! Configuration for the burrow server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the cache server
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version = "0.1.0")]
#[command(about = "A memcached-compatible cache server over an ordered store", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:11211)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum memory usage in bytes (e.g., 67108864 for 64MB)
    #[arg(short = 'm', long)]
    pub max_memory: Option<usize>,

    /// Default TTL for items in seconds (0 = no expiration)
    #[arg(short = 't', long)]
    pub default_ttl: Option<u64>,

    /// Number of reactor workers (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of reactor workers (0 = one per CPU core)
    #[serde(default)]
    pub workers: usize,
    /// Maximum concurrent connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// I/O buffer size: receive buffer capacity and send-chain link size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Poll event batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: 0,
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Maximum memory usage in bytes
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
    /// Default TTL for items in seconds
    #[serde(default)]
    pub default_ttl: u64,
    /// Interval for running expiration cleanup in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Number of storage worker threads
    #[serde(default = "default_store_workers")]
    pub workers: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
            default_ttl: 0,
            cleanup_interval: default_cleanup_interval(),
            workers: default_store_workers(),
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

fn default_listen() -> String {
    "127.0.0.1:11211".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_batch_size() -> usize {
    64
}

fn default_max_memory() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_cleanup_interval() -> u64 {
    60 // seconds
}

fn default_store_workers() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub max_memory: usize,
    pub default_ttl: u64,
    pub cleanup_interval: u64,
    pub store_workers: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::merge(CliArgs::parse())
    }

    fn merge(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_connections: toml_config.server.max_connections,
            buffer_size: toml_config.server.buffer_size,
            batch_size: toml_config.server.batch_size,
            max_memory: cli.max_memory.unwrap_or(toml_config.storage.max_memory),
            default_ttl: cli.default_ttl.unwrap_or(toml_config.storage.default_ttl),
            cleanup_interval: toml_config.storage.cleanup_interval,
            store_workers: toml_config.storage.workers,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
