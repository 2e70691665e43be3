//! Configuration of the `nbsock-echo` server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::context::{ConnectionDefaults, RuntimeConfig};
use crate::io::{SocketOptions, TlsActivation};
use crate::protocols::echo::EchoMode;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "nbsock-echo")]
#[command(version)]
#[command(about = "Echo server on the nbsock connection framework", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Echo mode: line or length-prefixed
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Number of dispatcher threads (0 = one per CPU core)
    #[arg(short = 'd', long)]
    pub dispatchers: Option<usize>,

    /// Number of callback worker threads (0 = run callbacks on dispatchers)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub server: ServerSection,
    pub runtime: RuntimeSection,
    pub tls: TlsSection,
    pub socket: SocketOptions,
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen: String,
    pub mode: EchoMode,
    pub backlog: i32,
    /// Initial write rate in bytes per second; enables throttling.
    pub write_rate: Option<u64>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mode: EchoMode::default(),
            backlog: 1024,
            write_rate: None,
        }
    }
}

/// Dispatcher and worker configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub dispatchers: usize,
    pub workers: usize,
    pub max_connections: usize,
    pub preallocation_size: usize,
    pub min_preallocated_size: usize,
    pub read_chunk: usize,
    pub tick_ms: u64,
    pub timeout_check_ms: u64,
    /// Defaults for every connection; `socket` comes from `[socket]`.
    pub connection: ConnectionDefaults,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        let runtime = RuntimeConfig::default();
        Self {
            dispatchers: runtime.dispatchers,
            workers: runtime.worker_threads,
            max_connections: runtime.max_connections,
            preallocation_size: runtime.preallocation_size,
            min_preallocated_size: runtime.min_preallocated_size,
            read_chunk: runtime.read_chunk,
            tick_ms: runtime.tick.as_millis() as u64,
            timeout_check_ms: runtime.timeout_check_interval.as_millis() as u64,
            connection: runtime.defaults,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TlsSection {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Start in plaintext and switch on request.
    pub deferred: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// TLS certificate material for the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub activation: TlsActivation,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub mode: EchoMode,
    pub backlog: i32,
    pub write_rate: Option<u64>,
    pub runtime: RuntimeConfig,
    pub tls: Option<TlsConfig>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{listen}'")))?;

        let mode = match cli.mode.as_deref() {
            None => toml_config.server.mode,
            Some("line") => EchoMode::Line,
            Some("length-prefixed") => EchoMode::LengthPrefixed,
            Some(other) => return Err(ConfigError::Invalid(format!("unknown echo mode '{other}'"))),
        };

        let section = toml_config.runtime;
        let runtime = RuntimeConfig {
            name: "nbsock".to_string(),
            dispatchers: cli.dispatchers.unwrap_or(section.dispatchers),
            worker_threads: cli.workers.unwrap_or(section.workers),
            max_connections: section.max_connections,
            preallocation_size: section.preallocation_size,
            min_preallocated_size: section.min_preallocated_size,
            read_chunk: section.read_chunk,
            tick: Duration::from_millis(section.tick_ms.max(1)),
            timeout_check_interval: Duration::from_millis(section.timeout_check_ms.max(1)),
            defaults: ConnectionDefaults {
                socket: toml_config.socket,
                ..section.connection
            },
        };

        let activation = if toml_config.tls.deferred {
            TlsActivation::Deferred
        } else {
            TlsActivation::Eager
        };
        let tls = match (
            cli.tls_cert.or(toml_config.tls.cert),
            cli.tls_key.or(toml_config.tls.key),
        ) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert,
                key,
                activation,
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid(
                    "TLS needs both a certificate and a key".to_string(),
                ))
            }
        };

        Ok(Config {
            listen,
            mode,
            backlog: toml_config.server.backlog,
            write_rate: toml_config.server.write_rate,
            runtime,
            tls,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
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
            ConfigError::Invalid(message) => write!(f, "Invalid configuration: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}
