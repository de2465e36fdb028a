//! Error types for maildrain

use thiserror::Error;

/// Main error type for maildrain
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Interrupted: {0}")]
    Signal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for maildrain
pub type Result<T> = std::result::Result<T, Error>;
