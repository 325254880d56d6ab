//! Attribute lookup and configuration errors

use thiserror::Error;

/// Result type for attribute lookups
pub type AttributeResult<T> = Result<T, AttributeError>;

/// Errors that can occur when resolving an attribute path in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    /// No snapshot has been fetched for this vehicle
    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(String),

    /// The path does not resolve to a value
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// An intermediate segment (or the leaf) has the wrong type
    #[error("Type mismatch at '{segment}' in '{path}': expected {expected}")]
    TypeMismatch {
        /// Full dotted path being resolved
        path: String,
        /// Segment at which resolution failed
        segment: String,
        /// What the segment was expected to be
        expected: &'static str,
    },
}

impl AttributeError {
    pub(crate) fn type_mismatch(
        path: impl Into<String>,
        segment: impl Into<String>,
        expected: &'static str,
    ) -> Self {
        Self::TypeMismatch {
            path: path.into(),
            segment: segment.into(),
            expected,
        }
    }
}

/// A configuration value outside its accepted range
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: '{key}' must be at least {min} seconds, got {value}")]
    TooSmall {
        key: &'static str,
        min: u64,
        value: u64,
    },

    #[error("Invalid configuration: 'poll_budget' ({budget}s) is shorter than 'poll_interval' ({interval}s)")]
    BudgetBelowInterval { budget: u64, interval: u64 },
}
