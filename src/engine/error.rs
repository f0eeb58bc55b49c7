use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{ReservationId, ReservationStatus};
use crate::quota::QuotaDenial;
use crate::store::{StoreError, TransientError};
use crate::tz::TzError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Timezone(#[from] TzError),
    #[error("duration must be between 1 and {max} minutes, got {got}")]
    Duration { got: u32, max: u32 },
    #[error("party size must be between 1 and {max}, got {got}")]
    PartySize { got: u32, max: u32 },
    #[error("party of {party_size} does not fit table capacity {min}-{max}")]
    Capacity { party_size: u32, min: u32, max: u32 },
    #[error("invalid capacity range {min}-{max}")]
    CapacityRange { min: u32, max: u32 },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} too long")]
    TooLong(&'static str),
    #[error("requested time out of supported range")]
    OutOfRange,
    #[error("max_results must be between 1 and {0}")]
    MaxResults(usize),
}

/// Local-time window of the reservation that blocks a request, e.g. `19:00–21:00`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictWindow {
    pub reservation_id: ReservationId,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl std::fmt::Display for ConflictWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\u{2013}{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("table busy {0}")]
    Conflict(ConflictWindow),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaDenial),
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("gave up after {attempts} attempt(s): {last}")]
    RetryExhausted {
        attempts: u32,
        last: TransientError,
    },
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<TzError> for EngineError {
    fn from(e: TzError) -> Self {
        EngineError::Validation(ValidationError::Timezone(e))
    }
}

/// Paths without a retry loop surface a transient failure as a single exhausted attempt.
impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(last) => EngineError::RetryExhausted { attempts: 1, last },
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            StoreError::Persistence(msg) => EngineError::Persistence(msg),
        }
    }
}
