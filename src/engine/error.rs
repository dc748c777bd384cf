use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, DateRange};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Booking-level rejection: the requested nights are taken.
    #[error("dates unavailable: {0}")]
    DatesUnavailable(DateRange),

    /// Calendar-level rejection from a reservation.
    #[error("range unavailable: {0}")]
    RangeUnavailable(DateRange),

    #[error("promotion not found: {0}")]
    PromotionNotFound(Ulid),

    #[error("promotion expired: {0}")]
    PromotionExpired(Ulid),

    #[error("promotion exhausted: {0}")]
    PromotionExhausted(Ulid),

    #[error("promotion {promotion_id} already used by {user_id} on this property")]
    PromotionAlreadyUsedByUser { promotion_id: Ulid, user_id: Ulid },

    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),

    #[error("property not found: {0}")]
    PropertyNotFound(Ulid),

    #[error("cancellation policy not found: {0}")]
    PolicyNotFound(Ulid),

    #[error("booking {id}: cannot {action} while {from:?}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        action: &'static str,
    },

    #[error("booking {0} is referenced by a payment")]
    PaymentReferenced(Ulid),

    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("storage busy, retry later")]
    StorageBusy,

    /// Log write failure inside a single attempt. Retried, then surfaced as `StorageFailure`.
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl EngineError {
    /// Errors a caller may resubmit unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StorageBusy | EngineError::Wal(_))
    }

    /// What the retry loop reports once its attempts are spent.
    pub(super) fn exhausted(self) -> Self {
        match self {
            EngineError::Wal(msg) => EngineError::StorageFailure(msg),
            other => other,
        }
    }
}
