//! Configuration for maildrain

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Account and mailbox selection
    pub account: AccountConfig,

    /// Maildir delivery target
    pub maildir: MaildirConfig,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Session behavior
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// IMAP account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Server hostname
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login username
    pub username: String,

    /// Login password
    pub password: String,

    /// Mailbox to drain
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

fn default_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

/// Maildir delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaildirConfig {
    /// Maildir root (tmp/, new/ and cur/ live below it)
    pub path: PathBuf,

    /// Host part of generated unique filenames
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Use TLS for the connection
    #[serde(default = "default_tls_enabled")]
    pub enabled: bool,

    /// Cipher-suite allowlist; empty means provider defaults
    #[serde(default)]
    pub cipher: Vec<String>,

    /// Optional pinned SHA-1 fingerprint of the server's leaf certificate,
    /// hex with or without ':' separators
    pub fingerprint: Option<String>,
}

fn default_tls_enabled() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: default_tls_enabled(),
            cipher: Vec::new(),
            fingerprint: None,
        }
    }
}

/// Session behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long to wait for the server greeting before capability
    /// discovery proceeds unconditionally, in milliseconds
    #[serde(default = "default_greeting_wait_ms")]
    pub greeting_wait_ms: u64,

    /// Mark fetched messages \Deleted and expunge them
    #[serde(default)]
    pub delete: bool,
}

fn default_greeting_wait_ms() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            greeting_wait_ms: default_greeting_wait_ms(),
            delete: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Fallback filter directive when RUST_LOG is unset
    #[serde(default = "default_directive")]
    pub directive: String,
}

fn default_directive() -> String {
    "info,maildrain=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directive: default_directive(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./maildrain.toml"),
            PathBuf::from("/etc/maildrain/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Reject configurations that cannot possibly drain a mailbox.
    pub fn validate(&self) -> crate::Result<()> {
        if self.account.host.is_empty() {
            return Err(crate::Error::Config("account.host is empty".to_string()));
        }
        if self.account.port == 0 {
            return Err(crate::Error::Config("account.port is 0".to_string()));
        }
        if self.account.username.is_empty() {
            return Err(crate::Error::Config(
                "account.username is empty".to_string(),
            ));
        }
        if self.account.mailbox.is_empty() {
            return Err(crate::Error::Config(
                "account.mailbox is empty".to_string(),
            ));
        }
        if self.maildir.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("maildir.path is empty".to_string()));
        }
        Ok(())
    }
}
