//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
///
/// Every variant is a caller error: it is reported synchronously and never
/// causes a state change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Device name does not match any arbitrable device
    #[error("Unknown device: {name} (expected one of: sdr, wifi_adapter, bluetooth_radio)")]
    UnknownDevice { name: String },

    /// A sweep was requested without any frequency targets
    #[error("At least one frequency target is required")]
    EmptyTargets,

    /// Frequency value is not usable
    #[error("Invalid frequency {value}: {reason}")]
    InvalidFrequency { value: String, reason: String },

    /// Dwell / cycle time is not usable
    #[error("Invalid dwell time {value}: {reason}")]
    InvalidDwell { value: String, reason: String },

    /// Owner identifier is empty or malformed
    #[error("Invalid owner id: {reason}")]
    InvalidOwner { reason: String },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    /// Creates an invalid-frequency error.
    pub fn frequency(value: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidFrequency {
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid-dwell error.
    pub fn dwell(value: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidDwell {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
