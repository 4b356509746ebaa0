//! Configuration module for the dispatch server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How accepted connections are handed to the connection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyType {
    /// Handle each connection on the accepting thread.
    Sequential,
    /// Spawn a new thread for every connection.
    ThreadPerTask,
    /// Queue connections for a fixed pool of worker threads.
    Pooled,
}

/// What a bounded pool queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Block the accept loop until a slot frees up.
    Block,
    /// Refuse the connection and close it.
    Reject,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "conn-dispatch")]
#[command(author = "conn-dispatch authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-echo server with pluggable connection dispatch", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Dispatch strategy
    #[arg(short, long, value_enum)]
    pub strategy: Option<StrategyType>,

    /// Number of pooled worker threads
    #[arg(short = 'w', long)]
    pub pool_size: Option<usize>,

    /// Bound on queued connections for the pooled strategy (unbounded if unset)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Behaviour of a full bounded queue
    #[arg(long, value_enum)]
    pub queue_policy: Option<QueuePolicy>,

    /// Stack size in bytes for spawned connection and worker threads
    #[arg(long)]
    pub stack_size: Option<usize>,

    /// Per-connection read timeout in milliseconds (no timeout if unset)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

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
    pub pool: PoolConfig,
    #[serde(default)]
    pub threads: ThreadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_strategy")]
    pub strategy: StrategyType,
    pub read_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            strategy: default_strategy(),
            read_timeout_ms: None,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: usize,
    pub queue_capacity: Option<usize>,
    #[serde(default = "default_queue_policy")]
    pub queue_policy: QueuePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            queue_capacity: None,
            queue_policy: default_queue_policy(),
        }
    }
}

/// Thread creation configuration
#[derive(Debug, Deserialize, Default)]
pub struct ThreadConfig {
    pub stack_size: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    59090
}

fn default_strategy() -> StrategyType {
    StrategyType::Pooled
}

fn default_pool_size() -> usize {
    100
}

fn default_queue_policy() -> QueuePolicy {
    QueuePolicy::Block
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub strategy: StrategyType,
    pub pool_size: usize,
    pub queue_capacity: Option<usize>,
    pub queue_policy: QueuePolicy,
    pub stack_size: Option<usize>,
    pub read_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            strategy: default_strategy(),
            pool_size: default_pool_size(),
            queue_capacity: None,
            queue_policy: default_queue_policy(),
            stack_size: None,
            read_timeout: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
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

        Self::merge(cli, toml_config)
    }

    /// Merge parsed CLI args over a TOML config and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            strategy: cli.strategy.unwrap_or(toml_config.server.strategy),
            pool_size: cli.pool_size.unwrap_or(toml_config.pool.size),
            queue_capacity: cli.queue_capacity.or(toml_config.pool.queue_capacity),
            queue_policy: cli.queue_policy.unwrap_or(toml_config.pool.queue_policy),
            stack_size: cli.stack_size.or(toml_config.threads.stack_size),
            read_timeout: match cli.read_timeout_ms.or(toml_config.server.read_timeout_ms) {
                Some(0) => {
                    return Err(ConfigError::Invalid(
                        "read_timeout_ms must be greater than zero".to_string(),
                    ))
                }
                Some(ms) => Some(Duration::from_millis(ms)),
                None => None,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        if config.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "pool_size must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// The `host:port` string the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
