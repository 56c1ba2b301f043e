//! Error types for fleetmon
//!
//! Every fallible operation in the crate returns [`FleetResult`]. RPC
//! handlers convert a [`FleetError`] into an error response carrying the
//! errno from [`FleetError::errnum`] plus an optional human readable string.

use thiserror::Error;

use crate::idset::IdSetError;

/// Result type for fleetmon operations
pub type FleetResult<T> = Result<T, FleetError>;

/// Main error type for fleetmon operations
#[derive(Error, Debug)]
pub enum FleetError {
    /// Allocation failed. The operation left all state untouched.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Malformed request payload or out-of-range parameter
    #[error("Protocol error: {message}")]
    Protocol {
        /// errno returned to the caller
        errnum: i32,
        /// Diagnostic text
        message: String,
    },

    /// A group subscription stopped delivering updates
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Internal consistency check failed
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Appending to the event log failed
    #[error("Event log error: {0}")]
    EventLog(String),

    /// Idset codec errors
    #[error("Idset error: {0}")]
    IdSet(#[from] IdSetError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Build a protocol error with `EPROTO`
    pub fn protocol(message: impl Into<String>) -> Self {
        FleetError::Protocol {
            errnum: libc::EPROTO,
            message: message.into(),
        }
    }

    /// The errno reported to RPC callers for this error
    pub fn errnum(&self) -> i32 {
        match self {
            FleetError::ResourceExhausted(_) => libc::ENOMEM,
            FleetError::Protocol { errnum, .. } => *errnum,
            FleetError::UpstreamUnavailable(_) => libc::EHOSTUNREACH,
            FleetError::InvariantViolation(_) => libc::EINVAL,
            FleetError::EventLog(_) => libc::EIO,
            FleetError::IdSet(_) => libc::EINVAL,
            FleetError::Config(_) => libc::EINVAL,
            FleetError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FleetError::Json(_) => libc::EPROTO,
        }
    }
}

impl From<std::collections::TryReserveError> for FleetError {
    fn from(err: std::collections::TryReserveError) -> Self {
        FleetError::ResourceExhausted(err.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errnum_mapping() {
        assert_eq!(FleetError::protocol("bad").errnum(), libc::EPROTO);
        assert_eq!(
            FleetError::ResourceExhausted("queue".into()).errnum(),
            libc::ENOMEM
        );
        assert_eq!(
            FleetError::UpstreamUnavailable("broker.online".into()).errnum(),
            libc::EHOSTUNREACH
        );
    }

    #[test]
    fn test_protocol_display() {
        let err = FleetError::protocol("up value is out of range");
        assert_eq!(err.to_string(), "Protocol error: up value is out of range");
    }
}
