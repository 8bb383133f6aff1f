//! Configuration module for the echoplex server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Triggering discipline for readiness events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeType {
    /// Level-triggered: readiness re-reported while data remains unread.
    Level,
    /// Edge-triggered: reported once per readable transition; drain fully.
    Edge,
    /// Edge-triggered oneshot: disarmed after one delivery until re-armed.
    EdgeOneshot,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echoplex")]
#[command(version = "0.1.0")]
#[command(about = "A nonblocking TCP echo server with selectable epoll trigger modes", long_about = None)]
pub struct CliArgs {
    /// Address to bind to (e.g., 127.0.0.1)
    pub host: Option<String>,

    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Trigger mode for connection descriptors
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<ModeType>,

    /// Number of drain worker threads (edge-oneshot mode only)
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
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Trigger mode for connection descriptors
    pub mode: Option<ModeType>,
    /// Number of drain worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-recv buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum readiness events consumed per wait call
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: None,
            workers: None,
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            max_events: default_max_events(),
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

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    4096
}

fn default_max_events() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub mode: ModeType,
    pub workers: usize,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub max_events: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = match CliArgs::try_parse() {
            Ok(cli) => cli,
            // Help and version are requests, not errors: stdout, exit 0
            Err(e) if is_display_request(&e) => e.exit(),
            Err(e) => return Err(ConfigError::BadArgs(e)),
        };
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        // Bind address and port are mandatory
        let (host, port) = match (cli.host, cli.port) {
            (Some(host), Some(port)) => (host, port),
            _ => return Err(ConfigError::MissingAddress),
        };

        Ok(Config {
            host,
            port,
            mode: cli
                .mode
                .or(toml_config.server.mode)
                .unwrap_or(ModeType::Level),
            workers: cli
                .workers
                .or(toml_config.server.workers)
                .unwrap_or_else(default_workers)
                .max(1),
            max_connections: toml_config.server.max_connections,
            // A zero-sized recv buffer would make every read report EOF
            buffer_size: toml_config.server.buffer_size.max(1),
            max_events: toml_config.server.max_events.max(1),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Whether a clap error is a `--help`/`--version` display request rather
/// than a genuine argument error.
fn is_display_request(e: &clap::Error) -> bool {
    matches!(
        e.kind(),
        clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
    )
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    BadArgs(clap::Error),
    MissingAddress,
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::BadArgs(e) => write!(f, "{}", e),
            ConfigError::MissingAddress => {
                write!(f, "usage: echoplex <host> <port>")
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(host: Option<&str>, port: Option<u16>) -> CliArgs {
        CliArgs {
            host: host.map(str::to_string),
            port,
            config: None,
            mode: None,
            workers: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.server.buffer_size, 4096);
        assert_eq!(config.server.max_events, 1024);
        assert!(config.server.mode.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_address_is_error() {
        let err = Config::from_cli(cli(Some("127.0.0.1"), None)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAddress));

        let err = Config::from_cli(cli(None, None)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAddress));
    }

    #[test]
    fn test_cli_defaults_resolve() {
        let config = Config::from_cli(cli(Some("0.0.0.0"), Some(9000))).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.mode, ModeType::Level);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_zero_sizes_clamped_to_one() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            workers = 0
            buffer_size = 0
            max_events = 0
        "#,
        )
        .unwrap();

        let config = Config::resolve(cli(Some("127.0.0.1"), Some(9000)), toml_config).unwrap();
        assert_eq!(config.buffer_size, 1);
        assert_eq!(config.max_events, 1);
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn test_help_and_version_are_display_requests() {
        let help = CliArgs::try_parse_from(["echoplex", "--help"]).unwrap_err();
        assert!(is_display_request(&help));

        let version = CliArgs::try_parse_from(["echoplex", "--version"]).unwrap_err();
        assert!(is_display_request(&version));

        let bad_flag = CliArgs::try_parse_from(["echoplex", "--no-such-flag"]).unwrap_err();
        assert!(!is_display_request(&bad_flag));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            mode = "edge-oneshot"
            workers = 4
            max_connections = 256
            buffer_size = 1024

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.mode, Some(ModeType::EdgeOneshot));
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.server.buffer_size, 1024);
        assert_eq!(config.logging.level, "debug");
    }
}
