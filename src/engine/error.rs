use thiserror::Error;
use ulid::Ulid;

use crate::model::InvalidInterval;
use crate::store::StoreError;

/// Everything a create, update, cancel or query can fail with. The boundary
/// layer maps each variant to its own transport status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Malformed request; fix the input, retrying won't help.
    #[error("invalid interval: {0}")]
    InvalidInterval(#[from] InvalidInterval),
    /// Overlaps this active reservation, or lost a race for the slot.
    #[error("slot unavailable: overlaps reservation {0}")]
    SlotUnavailable(Ulid),
    #[error("reservation not found: {0}")]
    NotFound(Ulid),
    #[error("reservation already cancelled: {0}")]
    AlreadyCancelled(Ulid),
    /// Storage timed out or failed transiently; safe to retry later.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(id) => EngineError::SlotUnavailable(id),
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
            StoreError::Wal(msg) => EngineError::StoreUnavailable(format!("WAL: {msg}")),
        }
    }
}
