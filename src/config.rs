//! Configuration module for the simpledb server and client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::protocol::{DEFAULT_MAX_REQUEST_SIZE, DEFAULT_MAX_RESPONSE_SIZE};
use crate::resolver::{builtin_entries, ResolverTable, DEFAULT_RESPONSE};
use crate::server::MAX_CONNECTIONS_LIMIT;
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "simpledb")]
#[command(author = "simpledb authors")]
#[command(version = "0.1.0")]
#[command(about = "A minimal text query server and client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// What to run
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the query server (default)
    Serve(ServeArgs),
    /// Send queries to a running server and print the responses
    Query(QueryArgs),
    /// Start a server in-process and run the sample queries against it
    Demo(DemoArgs),
}

#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeArgs {
    /// Address to bind to (e.g., 127.0.0.1:9999)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of connections served at once
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum request size in bytes
    #[arg(long)]
    pub max_request_size: Option<usize>,
}

#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryArgs {
    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// User name (accepted, not yet sent to the server)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Password (accepted, not yet sent to the server)
    #[arg(long)]
    pub password: Option<String>,

    /// Per-query timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Queries to execute, in order
    #[arg(required = true)]
    pub queries: Vec<String>,
}

#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct DemoArgs {
    /// Address the in-process server binds to
    #[arg(short = 'l', long)]
    pub listen: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub listen: String,
    /// Maximum number of connections served at once
    pub max_connections: usize,
    /// Maximum request payload in bytes
    pub max_request_size: usize,
    /// Listen backlog
    pub backlog: u32,
    /// How long shutdown waits for open connections, in seconds
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: 1024,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            backlog: 1024,
            drain_timeout_secs: 30,
        }
    }
}

/// Client-related configuration
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Credentials are stored for a future handshake and never sent.
    pub user: String,
    pub password: String,
    /// Timeout for connect and for each execute, in milliseconds
    pub timeout_ms: Option<u64>,
    /// Maximum response payload in bytes
    pub max_response_size: usize,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// `host:port` string used for connecting and logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            user: "admin".to_string(),
            password: String::new(),
            timeout_ms: None,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("timeout_ms", &self.timeout_ms)
            .field("max_response_size", &self.max_response_size)
            .finish()
    }
}

/// Resolver table configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Response for unrecognized queries
    #[serde(default = "default_response")]
    pub default: String,
    /// Exact query -> response entries, in file order
    #[serde(default = "builtin_entries")]
    pub entries: IndexMap<String, String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default: default_response(),
            entries: builtin_entries(),
        }
    }
}

impl ResolverConfig {
    pub fn build(&self) -> ResolverTable {
        ResolverTable::new(self.entries.clone(), self.default.clone())
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
    "127.0.0.1:9999".to_string()
}

fn default_response() -> String {
    DEFAULT_RESPONSE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub resolver: ResolverConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut server = toml_config.server;
        let mut client = toml_config.client;
        let command = cli
            .command
            .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

        match &command {
            Command::Serve(args) => {
                if let Some(listen) = &args.listen {
                    server.listen = listen.clone();
                }
                if let Some(max_connections) = args.max_connections {
                    server.max_connections = max_connections;
                }
                if let Some(max_request_size) = args.max_request_size {
                    server.max_request_size = max_request_size;
                }
            }
            Command::Query(args) => {
                if let Some(host) = &args.host {
                    client.host = host.clone();
                }
                if let Some(port) = args.port {
                    client.port = port;
                }
                if let Some(user) = &args.user {
                    client.user = user.clone();
                }
                if let Some(password) = &args.password {
                    client.password = password.clone();
                }
                if args.timeout_ms.is_some() {
                    client.timeout_ms = args.timeout_ms;
                }
            }
            Command::Demo(args) => {
                if let Some(listen) = &args.listen {
                    server.listen = listen.clone();
                }
            }
        }

        let config = Config {
            command,
            server,
            client,
            resolver: toml_config.resolver,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .listen
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidAddress(self.server.listen.clone()))?;
        if self.client.port == 0 {
            return Err(ConfigError::InvalidPort(self.client.port));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::InvalidValue("server.max_connections must be at least 1"));
        }
        if self.server.max_connections > MAX_CONNECTIONS_LIMIT {
            return Err(ConfigError::InvalidValue("server.max_connections is too large"));
        }
        Ok(())
    }
}
