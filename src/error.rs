use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for logging and metrics.
///
/// This is a lightweight, cloneable representation of the error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Connection failed (timeout, refused, etc.)
    ConnectionFailed,
    /// Connection target could not be built
    InvalidTarget,
    /// Configuration or setup error
    Setup,
    /// Frame serialization error
    Encode,
}

/// Errors that can occur in ws-realtime
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection target URL has a scheme with no socket equivalent
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// Frame could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Client constructed outside a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

impl Error {
    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::UnsupportedScheme(_) => ErrorKind::InvalidTarget,
            Error::Encode(_) => ErrorKind::Encode,
            Error::Config(_) | Error::NoRuntime(_) => ErrorKind::Setup,
        }
    }
}
