//! Configuration module for the edge-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// How the readiness registry reports descriptor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Notify once per state transition. Every notification must be drained.
    #[default]
    Edge,
    /// Notify on every wait while the condition holds.
    Level,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "edge-echo")]
#[command(author = "edge-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A non-blocking TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog depth
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Number of event loops, one thread each (0 = one per CPU core)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum connections per event loop
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Readiness notification mode
    #[arg(long, value_enum)]
    pub trigger: Option<TriggerMode>,

    /// Maximum readiness events retrieved per wait
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Upper bound on a single wait, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Bytes requested per read syscall
    #[arg(long)]
    pub read_chunk: Option<usize>,

    /// Maximum unconsumed input bytes per connection
    #[arg(long)]
    pub max_input: Option<usize>,

    /// Output bytes per connection at which reading pauses
    #[arg(long)]
    pub max_output: Option<usize>,

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
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening endpoint configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            workers: default_workers(),
            max_connections: default_max_connections(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub trigger: TriggerMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerMode::default(),
            batch_size: default_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Per-connection buffer limits
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    #[serde(default = "default_buffer_limit")]
    pub max_input: usize,
    #[serde(default = "default_buffer_limit")]
    pub max_output: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_chunk: default_read_chunk(),
            max_input: default_buffer_limit(),
            max_output: default_buffer_limit(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_backlog() -> i32 {
    1024
}

fn default_workers() -> usize {
    1
}

fn default_max_connections() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    1024
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_read_chunk() -> usize {
    16 * 1024
}

fn default_buffer_limit() -> usize {
    1024 * 1024 // 1 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub workers: usize,
    pub max_connections: usize,
    pub trigger: TriggerMode,
    pub batch_size: usize,
    pub poll_timeout_ms: u64,
    pub read_chunk: usize,
    pub max_input: usize,
    pub max_output: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::empty(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            trigger: cli.trigger.unwrap_or(toml_config.runtime.trigger),
            batch_size: cli.batch_size.unwrap_or(toml_config.runtime.batch_size),
            poll_timeout_ms: cli
                .poll_timeout_ms
                .unwrap_or(toml_config.runtime.poll_timeout_ms),
            read_chunk: cli.read_chunk.unwrap_or(toml_config.buffers.read_chunk),
            max_input: cli.max_input.unwrap_or(toml_config.buffers.max_input),
            max_output: cli.max_output.unwrap_or(toml_config.buffers.max_output),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Resolve `host:port` into a socket address.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|_| ConfigError::InvalidAddress(addr))
    }

    /// Check that every limit is usable by the event loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.addr()?;
        let nonzero = [
            ("backlog", self.backlog.max(0) as usize),
            ("max_connections", self.max_connections),
            ("batch_size", self.batch_size),
            ("read_chunk", self.read_chunk),
            ("max_input", self.max_input),
            ("max_output", self.max_output),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(name));
            }
        }
        Ok(())
    }

    /// Number of event loops to run, resolving `0` to the CPU count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
    }
}

impl CliArgs {
    fn empty() -> Self {
        CliArgs {
            config: None,
            host: None,
            port: None,
            backlog: None,
            workers: None,
            max_connections: None,
            trigger: None,
            batch_size: None,
            poll_timeout_ms: None,
            read_chunk: None,
            max_input: None,
            max_output: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(String),
    /// A limit that must be positive was zero or negative.
    Invalid(&'static str),
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
            ConfigError::InvalidAddress(addr) => {
                write!(f, "Invalid listen address '{addr}'")
            }
            ConfigError::Invalid(field) => {
                write!(f, "Configuration value '{field}' must be greater than zero")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
