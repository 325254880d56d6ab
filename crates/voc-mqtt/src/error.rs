//! Error types for the bridge

use thiserror::Error;

/// Message bus errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("MQTT client error: {0}")]
    Client(String),

    #[error("Broker configuration error: {0}")]
    Config(String),
}

/// Errors that stop the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Bus connection closed")]
    Closed,
}

/// Result type alias for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;
