//! Notification subsystem error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Errors surfaced by the notification subsystem.
///
/// Transport failures on the streaming channel are not represented here: they
/// only ever show up as a [`ConnectionState`](crate::ConnectionState).
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Inbound payload did not match the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// REST backend answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// REST request could not be performed
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed base or channel address
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation needs an authenticated identity
    #[error("No active identity")]
    NoIdentity,

    /// The identity changed while the operation was in flight
    #[error("Identity changed before the operation completed")]
    Superseded,

    /// The background service task is gone
    #[error("Notification service is not running")]
    ServiceStopped,
}

impl NotifyError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }
}
