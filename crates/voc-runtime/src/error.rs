//! Error types for the runtime components

use thiserror::Error;
use voc_client::TransportError;
use voc_core::{CommandKind, VehicleId};

/// Errors from the vehicle registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The id is not in the registry
    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(VehicleId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RegistryError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_auth())
    }
}

/// Errors from command submission and awaiting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokerError {
    /// Commands are disabled by configuration
    #[error("Vehicle commands are disabled (read-only mode)")]
    ReadOnly,

    /// An invocation for the same vehicle and command is still in flight
    #[error("A {kind} command is already in progress for {vehicle_id}")]
    Conflict {
        vehicle_id: VehicleId,
        kind: CommandKind,
    },

    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(VehicleId),

    /// Submission failed at the transport level
    #[error("Submission failed: {0}")]
    Transport(#[from] TransportError),

    /// The service accepted the command but returned no way to track it
    #[error("Invalid service response: {0}")]
    InvalidResponse(String),

    /// The invoker shut down before the invocation finished
    #[error("Invocation cancelled")]
    Cancelled,
}

/// Result type alias for invoker operations
pub type InvokerResult<T> = std::result::Result<T, InvokerError>;
