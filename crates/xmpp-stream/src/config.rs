//! TOML client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::client::{ConnectOptions, Credentials};
use crate::negotiation::{SessionPolicy, StreamManagementOptions, TlsPolicy};
use crate::resolver::DEFAULT_CLIENT_PORT;
use crate::stream::DEFAULT_TIMEOUT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub account: AccountConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub stream_management: StreamManagementConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub jid: String,
    pub password: String,
    /// Overrides the JID domain for endpoint discovery.
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub tls: TlsPolicy,
    /// Seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub session: SessionPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tls: TlsPolicy::default(),
            timeout: default_timeout_secs(),
            session: SessionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamManagementConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Clone, Deserialize)]
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

fn default_port() -> u16 {
    DEFAULT_CLIENT_PORT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl ClientConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(toml_str).map_err(|e| {
            let (line, column) = e.span().map_or((0, 0), |span| {
                let before = &toml_str[..span.start];
                let line = before.chars().filter(|&c| c == '\n').count() + 1;
                let column = before
                    .rfind('\n')
                    .map_or(span.start + 1, |nl| span.start - nl);
                (line, column)
            });
            ConfigError::InvalidToml {
                line,
                column,
                message: e.message().to_string(),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();

        if self.account.jid.is_empty() {
            missing.push("account.jid".to_string());
        }
        if self.account.password.is_empty() {
            missing.push("account.password".to_string());
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingRequiredFields { fields: missing });
        }

        if let Err(e) = jid::Jid::new(&self.account.jid) {
            return Err(ConfigError::InvalidValue {
                field: "account.jid".to_string(),
                message: e.to_string(),
            });
        }

        if self.connection.timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connection.timeout".to_string(),
                message: "must be at least one second".to_string(),
            });
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
            });
        }

        Ok(())
    }

    /// Filter directives for [`crate::telemetry::init`]: the configured level
    /// for this crate, `warn` for everything else.
    pub fn log_directives(&self) -> String {
        format!("warn,xmpp_stream={}", self.logging.level)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.connection.timeout)
    }

    /// Build connect options; extensions and callbacks are left at their defaults.
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let credentials = Credentials::parse(&self.account.jid, self.account.password.clone())
            .map_err(|e| ConfigError::InvalidValue {
                field: "account.jid".to_string(),
                message: e.to_string(),
            })?;

        let mut options = ConnectOptions::new(credentials)
            .port(self.account.port)
            .tls(self.connection.tls)
            .session(self.connection.session)
            .timeout(self.timeout());
        if let Some(host) = &self.account.host {
            options = options.host(host.clone());
        }
        if self.stream_management.enabled {
            options = options.stream_management(StreamManagementOptions {
                resume: self.stream_management.resume,
            });
        }
        Ok(options)
    }
}
