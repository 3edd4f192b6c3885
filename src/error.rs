//! Error types for SCSI target core operations

use crate::sense::SenseReason;
use thiserror::Error;

/// SCSI target core errors
///
/// These are transport- and configuration-level failures. Anything that can be
/// reported to the initiator as a CHECK CONDITION travels as a [`SenseReason`]
/// instead and ends up in the command's sense buffer.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("SCSI error: {0}")]
    Scsi(#[from] SenseReason),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// Errors reported by a storage backend through its completion signals
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend I/O failure: {0}")]
    Io(String),

    #[error("reservation conflict")]
    ReservationConflict,

    #[error("operation not supported by backend")]
    Unsupported,

    #[error("backend out of resources")]
    NoResources,

    /// A completion token was dropped without being signalled.
    #[error("completion abandoned before it was signalled")]
    Abandoned,
}

impl BackendError {
    /// Sense reason reported to the initiator for this backend failure
    pub fn sense_reason(&self) -> SenseReason {
        match self {
            BackendError::ReservationConflict => SenseReason::ReservationConflict,
            BackendError::Unsupported => SenseReason::UnsupportedScsiOpcode,
            BackendError::Io(_) | BackendError::NoResources | BackendError::Abandoned => {
                SenseReason::LogicalUnitCommunicationFailure
            }
        }
    }
}

/// Result type for target core operations
pub type TargetResult<T> = Result<T, TargetError>;
