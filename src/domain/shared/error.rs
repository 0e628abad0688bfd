//! Domain errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid state transition for call {call_id}: {from} -> {to}")]
    InvalidStateTransition {
        call_id: String,
        from: String,
        to: String,
    },

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    #[error("Hold failed: {0}")]
    HoldFailed(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Operation not available in {mode} mode: {operation}")]
    ModeMismatch { mode: String, operation: String },

    #[error("Certificate renewal failed: {0}")]
    RenewalFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn invalid_transition(
        call_id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        DomainError::InvalidStateTransition {
            call_id: call_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
