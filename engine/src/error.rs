//! Error types for the branchsync engine.

use crate::LocalId;
use thiserror::Error;

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Local persistence
    #[error("storage fault: {0}")]
    StorageFault(String),

    #[error("record not found: {0}")]
    RecordNotFound(LocalId),

    // Remote store
    #[error("remote rejected the operation: {0}")]
    RemoteRejected(String),

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("configuration fault: {0}")]
    ConfigurationFault(String),

    // Validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Whether the error came back from the remote store.
    ///
    /// Remote errors are absorbed by the drain loop and recorded against the
    /// queued operation; everything else is surfaced to the caller.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::RemoteRejected(_) | Error::RemoteUnreachable(_))
    }

    /// Whether the failure is expected to clear up once connectivity returns.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RemoteUnreachable(_))
    }

    /// Whether the error is a validation failure of caller-supplied fields.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPayload(_) | Error::MissingRequiredField(_) | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
