//! Error types for Strait

use thiserror::Error;

/// Main error type for Strait
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Ingress channel closed")]
    ChannelClosed,

    #[error("Resolve error: {0}")]
    Resolve(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Result type alias for Strait
pub type Result<T> = std::result::Result<T, Error>;
