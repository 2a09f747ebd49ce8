//! Configuration module for the prime server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// How accepted connections are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One connection at a time; the accept loop waits for each session.
    Serial,
    /// One detached OS thread per accepted connection.
    Threaded,
    /// All sessions interleaved on a single event loop thread.
    Cooperative,
}

/// Command-line arguments for the prime server
#[derive(Parser, Debug, Default)]
#[command(name = "prime-server")]
#[command(author = "prime-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server that answers with the Nth prime", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host name or address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of pending connections queued by the listener
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Use threads instead to handle requests
    #[arg(long)]
    pub use_threads: bool,

    /// Offload prime computation to the worker pool
    #[arg(long)]
    pub use_process_pool: bool,

    /// Execution strategy (overrides --use-threads)
    #[arg(short, long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Number of pool workers (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum bytes read from a connection per request
    #[arg(long)]
    pub max_read: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Also append log lines to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub compute: ComputeConfig,
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
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub use_threads: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            strategy: None,
            use_threads: false,
        }
    }
}

/// Compute-related configuration
#[derive(Debug, Deserialize)]
pub struct ComputeConfig {
    #[serde(default)]
    pub use_process_pool: bool,
    /// Number of pool workers
    pub workers: Option<usize>,
    #[serde(default = "default_max_read")]
    pub max_read: usize,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            use_process_pool: false,
            workers: None,
            max_read: default_max_read(),
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

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_backlog() -> u32 {
    5
}

fn default_max_read() -> usize {
    crate::protocol::MAX_READ_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub strategy: Strategy,
    pub use_process_pool: bool,
    pub workers: usize,
    pub max_read: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
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

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let use_threads = cli.use_threads || toml_config.server.use_threads;
        let strategy = cli
            .strategy
            .or(toml_config.server.strategy)
            .unwrap_or(if use_threads {
                Strategy::Threaded
            } else {
                Strategy::Serial
            });

        // The cooperative loop must never run compute on its own thread.
        let use_process_pool = strategy == Strategy::Cooperative
            || cli.use_process_pool
            || toml_config.compute.use_process_pool;

        let workers = cli
            .workers
            .or(toml_config.compute.workers)
            .unwrap_or_else(available_workers);
        if workers == 0 {
            return Err(ConfigError::Invalid("workers", "must be greater than 0"));
        }

        let max_read = cli.max_read.unwrap_or(toml_config.compute.max_read);
        if max_read == 0 {
            return Err(ConfigError::Invalid("max_read", "must be greater than 0"));
        }

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            strategy,
            use_process_pool,
            workers,
            max_read,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, &'static str),
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
            ConfigError::Invalid(field, reason) => {
                write!(f, "Invalid value for '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliArgs {
        CliArgs::default()
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(), TomlConfig::default()).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8000);
        assert_eq!(config.backlog, 5);
        assert_eq!(config.strategy, Strategy::Serial);
        assert!(!config.use_process_pool);
        assert_eq!(config.max_read, 1024);
        assert!(config.workers >= 1);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            backlog = 64
            strategy = "cooperative"

            [compute]
            workers = 4
            max_read = 512

            [logging]
            level = "debug"
            file = "server.log"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.server.strategy, Some(Strategy::Cooperative));
        assert_eq!(config.compute.workers, Some(4));
        assert_eq!(config.compute.max_read, 512);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("server.log")));
    }

    #[test]
    fn test_use_threads_selects_threaded() {
        let mut args = cli();
        args.use_threads = true;
        let config = Config::merge(args, TomlConfig::default()).unwrap();
        assert_eq!(config.strategy, Strategy::Threaded);
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            strategy = "threaded"
            "#,
        )
        .unwrap();

        let mut args = cli();
        args.port = Some(7000);
        args.strategy = Some(Strategy::Serial);
        let config = Config::merge(args, toml_config).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.strategy, Strategy::Serial);
    }

    #[test]
    fn test_cli_log_level_overrides_toml() {
        let toml_config = || -> TomlConfig {
            toml::from_str(
                r#"
                [logging]
                level = "debug"
                "#,
            )
            .unwrap()
        };

        let config = Config::merge(cli(), toml_config()).unwrap();
        assert_eq!(config.log_level, "debug");

        // An explicit value wins even when it matches the default.
        let mut args = cli();
        args.log_level = Some("info".to_string());
        let config = Config::merge(args, toml_config()).unwrap();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_parses_log_level() {
        let args = CliArgs::parse_from(["prime-server", "--log-level", "info"]);
        assert_eq!(args.log_level.as_deref(), Some("info"));

        let args = CliArgs::parse_from(["prime-server"]);
        assert_eq!(args.log_level, None);
    }

    #[test]
    fn test_cooperative_forces_pool() {
        let mut args = cli();
        args.strategy = Some(Strategy::Cooperative);
        let config = Config::merge(args, TomlConfig::default()).unwrap();
        assert!(config.use_process_pool);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut args = cli();
        args.workers = Some(0);
        let err = Config::merge(args, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("workers", _)));
    }

    #[test]
    fn test_rejects_zero_max_read() {
        let mut args = cli();
        args.max_read = Some(0);
        let err = Config::merge(args, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("max_read", _)));
    }
}
