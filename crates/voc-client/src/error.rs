//! Error types for VOC transport operations

use thiserror::Error;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while talking to the VOC service
///
/// The payloads are plain strings so that one outcome (for example a failed
/// re-authentication) can be cloned and handed to every waiting caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Credentials were rejected or the session could not be re-established
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Connection failure or timeout
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed or unexpected response body
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned a non-success status
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// A path or URL could not be resolved
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    /// Create a server error from status code and message
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Server { status: 404, .. })
    }

    /// Errors worth retrying on the next tick or poll
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Server { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Network(err.to_string())
        } else if err.is_decode() || err.is_body() {
            Self::Protocol(err.to_string())
        } else if let Some(status) = err.status() {
            Self::server_error(status.as_u16(), err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<url::ParseError> for TransportError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
