//! Configuration module for framed-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocols::echo::DEFAULT_MAX_FRAME_SIZE;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "framed-echo")]
#[command(author = "framed-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed TCP echo server and client", long_about = None)]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Serve(ServeArgs),
    /// Send one payload to a server and print the echoed reply
    Send(SendArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum payload size of a single frame in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Maximum bytes queued for one connection before it is dropped (0 = unbounded)
    #[arg(long)]
    pub max_queued_bytes: Option<usize>,

    /// Maximum concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Server address
    #[arg(short = 'c', long, default_value = "127.0.0.1:7878")]
    pub connect: String,

    /// Maximum payload size accepted in either direction
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,

    /// Give up after this many milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Payload to send
    pub payload: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and event loop configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Accepts per poll cycle (0 = until the backlog is empty)
    #[serde(default)]
    pub max_accepts_per_cycle: usize,
    /// Events returned by a single poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Upper bound on how long a poll may block, in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            max_accepts_per_cycle: 0,
            events_capacity: default_events_capacity(),
            tick_ms: default_tick_ms(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Outbound bytes allowed per connection (0 = unbounded)
    #[serde(default = "default_max_queued_bytes")]
    pub max_queued_bytes: usize,
    /// Size of each read syscall
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Bytes written per connection per writable event (0 = unbounded)
    #[serde(default)]
    pub write_budget: usize,
    /// Idle timeout in seconds (0 = disabled)
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_queued_bytes: default_max_queued_bytes(),
            read_buffer_size: default_read_buffer_size(),
            write_budget: 0,
            idle_timeout_secs: 0,
        }
    }
}

/// Shutdown behaviour
#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    /// How long to keep flushing queued output after a shutdown request
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
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
    "127.0.0.1:7878".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_queued_bytes() -> usize {
    8 * 1024 * 1024 // 8 MB
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: u32,
    pub max_connections: usize,
    pub max_accepts_per_cycle: usize,
    pub events_capacity: usize,
    pub tick: Duration,
    pub max_frame_size: usize,
    pub max_queued_bytes: usize,
    pub read_buffer_size: usize,
    pub write_budget: usize,
    pub idle_timeout: Option<Duration>,
    pub grace_period: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(&ServeArgs::default(), "info", TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load(cli: &ServeArgs, log_level: &str) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, log_level, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: &ServeArgs, log_level: &str, toml: TomlConfig) -> Self {
        let idle_secs = cli
            .idle_timeout_secs
            .unwrap_or(toml.limits.idle_timeout_secs);

        Config {
            listen: cli.listen.clone().unwrap_or(toml.server.listen),
            backlog: toml.server.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml.server.max_connections),
            max_accepts_per_cycle: toml.server.max_accepts_per_cycle,
            events_capacity: toml.server.events_capacity,
            tick: Duration::from_millis(toml.server.tick_ms),
            max_frame_size: cli.max_frame_size.unwrap_or(toml.limits.max_frame_size),
            max_queued_bytes: cli
                .max_queued_bytes
                .unwrap_or(toml.limits.max_queued_bytes),
            read_buffer_size: toml.limits.read_buffer_size,
            write_budget: toml.limits.write_budget,
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            grace_period: Duration::from_millis(toml.shutdown.grace_period_ms),
            log_level: if log_level != "info" {
                log_level.to_string()
            } else {
                toml.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size {} does not fit the 32-bit length prefix",
                self.max_frame_size
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be non-zero".into()));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::Invalid("tick_ms must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero".into()));
        }
        Ok(())
    }

    /// Per-event write cap, `None` when unbounded.
    pub fn write_budget(&self) -> Option<usize> {
        (self.write_budget > 0).then_some(self.write_budget)
    }

    /// Accept cap per cycle, `None` when unbounded.
    pub fn accept_limit(&self) -> Option<usize> {
        (self.max_accepts_per_cycle > 0).then_some(self.max_accepts_per_cycle)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7878");
        assert_eq!(config.limits.max_frame_size, 1024 * 1024);
        assert_eq!(config.limits.max_queued_bytes, 8 * 1024 * 1024);
        assert_eq!(config.limits.idle_timeout_secs, 0);

        let resolved = Config::default();
        assert_eq!(resolved.idle_timeout, None);
        assert_eq!(resolved.write_budget(), None);
        assert_eq!(resolved.accept_limit(), None);
        assert_eq!(resolved.grace_period, Duration::from_secs(5));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            max_accepts_per_cycle = 32
            tick_ms = 250

            [limits]
            max_frame_size = 4096
            write_budget = 512
            idle_timeout_secs = 30

            [shutdown]
            grace_period_ms = 100

            [logging]
            level = "debug"
        "#;

        let toml: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml.server.listen, "0.0.0.0:9000");
        assert_eq!(toml.server.backlog, 1024);

        let config = Config::merge(&ServeArgs::default(), "info", toml);
        assert_eq!(config.max_frame_size, 4096);
        assert_eq!(config.write_budget(), Some(512));
        assert_eq!(config.accept_limit(), Some(32));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.tick, Duration::from_millis(250));
        assert_eq!(config.grace_period, Duration::from_millis(100));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            [limits]
            max_frame_size = 4096
            [logging]
            level = "debug"
        "#,
        )
        .unwrap();

        let cli = ServeArgs {
            listen: Some("127.0.0.1:1".into()),
            max_frame_size: Some(16),
            ..Default::default()
        };
        let config = Config::merge(&cli, "warn", toml);
        assert_eq!(config.listen, "127.0.0.1:1");
        assert_eq!(config.max_frame_size, 16);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_validate_rejects_zero_read_buffer() {
        let mut config = Config::default();
        config.read_buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let toml: TomlConfig = toml::from_str("[server]\ntick_ms = 0\n").unwrap();
        let config = Config::merge(&ServeArgs::default(), "info", toml);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_cli_subcommands() {
        let args = CliArgs::parse_from(["framed-echo", "send", "--connect", "127.0.0.1:1", "ping"]);
        match args.command {
            Command::Send(send) => {
                assert_eq!(send.connect, "127.0.0.1:1");
                assert_eq!(send.payload, "ping");
                assert_eq!(send.timeout_ms, 5000);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let args = CliArgs::parse_from(["framed-echo", "serve", "-l", "0.0.0.0:1", "--log-level", "debug"]);
        assert_eq!(args.log_level, "debug");
        assert!(matches!(args.command, Command::Serve(ServeArgs { listen: Some(_), .. })));
    }
}
