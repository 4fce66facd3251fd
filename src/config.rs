//! Configuration module for the drainpipe service
//!
//! Configuration is loaded with the following priority (highest first):
//! 1. Command line arguments
//! 2. Environment variables (prefixed with DRAINPIPE_)
//! 3. Configuration file (config.toml or config.yaml)
//! 4. Default values
//!
//! The resulting [`ServiceConfig`] is built once at startup and never changes
//! for the life of a run.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{ConfigError, Environment, File};
use serde::Deserialize;

/// Default host to bind to
const DEFAULT_HOST: &str = "0.0.0.0";
/// Default port
const DEFAULT_PORT: u16 = 4000;
/// Default deployment environment
const DEFAULT_ENV: &str = "development";
/// Default keep-alive idle timeout in seconds
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
/// Default request head read timeout in seconds
const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;
/// Default response timeout in seconds
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Accepted values for `env`
const ENVIRONMENTS: &[&str] = &["development", "staging", "production"];

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "drainpipe")]
#[command(about = "An HTTP service with bounded graceful shutdown")]
pub struct CliArgs {
    /// Host to bind the server to
    #[arg(long, env = "DRAINPIPE_HOST")]
    pub host: Option<String>,

    /// Port to bind the server to
    #[arg(short, long, env = "DRAINPIPE_PORT")]
    pub port: Option<u16>,

    /// Environment (development|staging|production)
    #[arg(short, long, env = "DRAINPIPE_ENV")]
    pub env: Option<String>,

    /// Seconds a keep-alive connection may sit idle before it is closed
    #[arg(long, env = "DRAINPIPE_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Seconds allowed for reading a request head
    #[arg(long, env = "DRAINPIPE_READ_TIMEOUT")]
    pub read_timeout: Option<u64>,

    /// Seconds allowed for producing a response
    #[arg(long, env = "DRAINPIPE_WRITE_TIMEOUT")]
    pub write_timeout: Option<u64>,

    /// Path to configuration file
    #[arg(short, long, env = "DRAINPIPE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// File-based configuration (for TOML/YAML)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    env: Option<String>,
    idle_timeout: Option<u64>,
    read_timeout: Option<u64>,
    write_timeout: Option<u64>,
}

/// Configuration for one run of the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Host to bind the server to
    pub host: String,

    /// Port to bind the server to (0 picks a free port)
    pub port: u16,

    /// Deployment environment, reported by the healthcheck
    pub env: String,

    /// How long a keep-alive connection may wait for its next request
    pub idle_timeout: Duration,

    /// How long a client has to send a request head
    pub read_timeout: Duration,

    /// How long a handler has to produce a response
    pub write_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            env: DEFAULT_ENV.to_string(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
        }
    }
}

impl ServiceConfig {
    /// Create a new configuration with explicit bind values and default timeouts
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Replace all three connection timeouts
    pub fn with_timeouts(mut self, idle: Duration, read: Duration, write: Duration) -> Self {
        self.idle_timeout = idle;
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Load configuration from all sources (CLI > env > file > defaults)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_args(CliArgs::parse())
    }

    /// Load configuration from provided CLI args (for testing)
    pub fn load_from_args(args: CliArgs) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = ServiceConfig::default();

        // Load from config file if specified or if default exists
        let file_config = Self::load_file_config(&args.config)?;

        // Apply file config (file overrides defaults)
        if let Some(h) = file_config.host {
            config.host = h;
        }
        if let Some(p) = file_config.port {
            config.port = p;
        }
        if let Some(env) = file_config.env {
            config.env = env;
        }
        if let Some(secs) = file_config.idle_timeout {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file_config.read_timeout {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file_config.write_timeout {
            config.write_timeout = Duration::from_secs(secs);
        }

        // Apply CLI args (CLI overrides everything)
        if let Some(h) = args.host {
            config.host = h;
        }
        if let Some(p) = args.port {
            config.port = p;
        }
        if let Some(env) = args.env {
            config.env = env;
        }
        if let Some(secs) = args.idle_timeout {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = args.read_timeout {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = args.write_timeout {
            config.write_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    fn load_file_config(config_path: &Option<PathBuf>) -> Result<FileConfig, ConfigError> {
        let mut builder = config::Config::builder();

        // Add config file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path.as_path()));
        } else {
            // Try default config files (optional)
            builder = builder
                .add_source(File::with_name("config").required(false))
                .add_source(File::with_name("drainpipe").required(false));
        }

        // Add environment variables with DRAINPIPE_ prefix
        builder = builder.add_source(
            Environment::with_prefix("DRAINPIPE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        settings.try_deserialize()
    }

    /// Reject values the server cannot run with
    fn validate(&self) -> Result<(), ConfigError> {
        if !ENVIRONMENTS.contains(&self.env.as_str()) {
            return Err(ConfigError::Message(format!(
                "env must be one of {}, got {:?}",
                ENVIRONMENTS.join("|"),
                self.env
            )));
        }

        let timeouts = [
            ("idle_timeout", self.idle_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::Message(format!("{name} must be greater than zero")));
            }
        }

        Ok(())
    }

    /// Get the socket address for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
