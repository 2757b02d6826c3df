use thiserror::Error;

use crate::fate::{FateId, TxStatus};

pub type Result<T, E = FateError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum FateError {
    #[error("Transaction not found: {0}")]
    NotFound(FateId),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Concurrent modification of {0} kept conflicting, giving up")]
    VersionConflict(FateId),

    #[error("Invariant violated for {id}: {detail}")]
    InvariantViolation { id: FateId, detail: String },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: FateId,
        from: TxStatus,
        to: TxStatus,
    },

    #[error("Reservation on {0} was lost while a step was running")]
    ReservationLost(FateId),

    #[error("Lock request on `{resource}` denied for {id}")]
    LockDenied { id: FateId, resource: String },

    #[error("Unknown step type `{0}`")]
    UnknownStep(String),

    #[error("Transaction {id} cannot be cancelled in status {status}")]
    NotCancellable { id: FateId, status: TxStatus },

    #[error("Transaction {id} cannot be deleted in status {status}")]
    NotDeletable { id: FateId, status: TxStatus },

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FateError {
    pub(crate) fn invariant(id: FateId, detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            id,
            detail: detail.into(),
        }
    }

    /// Conditions the scheduler absorbs by deferring and retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FateError::StoreUnavailable(_) | FateError::VersionConflict(_) | FateError::Io(_)
        )
    }

    /// Programming errors. The offending worker iteration is abandoned and
    /// the record is left untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FateError::InvariantViolation { .. } | FateError::InvalidTransition { .. }
        )
    }
}
