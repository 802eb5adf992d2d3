use thiserror::Error;

use crate::entity::RecordKey;
use crate::store::{LockKey, StoreError};

pub type Result<T> = std::result::Result<T, GraphError>;

/// Every way an engine operation can fail.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The id does not resolve to a live record.
    #[error("{0} does not exist")]
    NotFound(RecordKey),
    /// The acting user lacks ownership or the required role.
    #[error("{reason}")]
    Unauthorized { reason: String },
    /// A duplicate or an invariant-violating state. Retryable when caused by
    /// a storage failure that was rolled back.
    #[error("{reason}")]
    Conflict { reason: String, retryable: bool },
    /// A reorder request that would produce gaps or duplicate positions.
    #[error("invalid order: {reason}")]
    InvalidOrder { reason: String },
    /// The target changed or was removed by a concurrent operation.
    /// Callers should re-fetch and retry.
    #[error("stale reference: {reason}")]
    StaleReference { reason: String },
    /// A lock was not acquired within the configured timeout.
    #[error("timed out waiting for {0}")]
    Timeout(LockKey),
    /// A user tried to follow themselves.
    #[error("a user cannot follow themselves")]
    SelfReferenceDenied,
    /// The storage backend failed outside of an apply phase.
    #[error(transparent)]
    Internal(#[from] StoreError),
}

impl GraphError {
    pub fn not_found(key: RecordKey) -> Self {
        Self::NotFound(key)
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn retryable_conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn invalid_order(reason: impl Into<String>) -> Self {
        Self::InvalidOrder {
            reason: reason.into(),
        }
    }

    pub fn stale(reason: impl Into<String>) -> Self {
        Self::StaleReference {
            reason: reason.into(),
        }
    }

    /// Whether the caller should re-fetch and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::StaleReference { .. } => true,
            Self::Conflict { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
