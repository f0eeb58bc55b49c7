use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::conflict::find_conflict;
use super::error::{ConflictWindow, EngineError, ValidationError};
use super::{validate_party_size, Engine};
use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;
use crate::observability::{
    BOOKINGS_TOTAL, BOOKING_ATTEMPTS_TOTAL, BOOKING_DURATION_SECONDS, BOOKING_RETRIES_TOTAL,
};
use crate::store::{LockScope, StoreError, TransientError, UnitOfWork};
use crate::tz::TzError;

/// Inbound booking request, expressed in the restaurant's wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub tenant_id: TenantId,
    pub table_id: TableId,
    pub guest_id: GuestId,
    pub local_date: NaiveDate,
    pub local_time: NaiveTime,
    /// IANA zone the local date/time are expressed in.
    pub zone: String,
    /// Falls back to the tenant default, then the engine default.
    pub duration_minutes: Option<u32>,
    pub party_size: u32,
}

/// How one attempt ended when it did not produce a reservation.
enum AttemptError {
    Transient(TransientError),
    Failed(EngineError),
}

impl From<StoreError> for AttemptError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(t) => AttemptError::Transient(t),
            other => AttemptError::Failed(other.into()),
        }
    }
}

impl From<EngineError> for AttemptError {
    fn from(e: EngineError) -> Self {
        AttemptError::Failed(e)
    }
}

impl From<ValidationError> for AttemptError {
    fn from(e: ValidationError) -> Self {
        AttemptError::Failed(e.into())
    }
}

impl From<TzError> for AttemptError {
    fn from(e: TzError) -> Self {
        AttemptError::Failed(e.into())
    }
}

fn outcome_label(result: &Result<Reservation, EngineError>) -> &'static str {
    match result {
        Ok(_) => "booked",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::QuotaExceeded(_)) => "quota_exceeded",
        Err(EngineError::Validation(_)) => "invalid",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::RetryExhausted { .. }) => "retry_exhausted",
        Err(EngineError::Persistence(_)) => "persistence_error",
        Err(EngineError::AlreadyExists(_) | EngineError::InvalidTransition { .. }) => "rejected",
    }
}

struct Plan {
    id: ReservationId,
    span: Span,
    duration_minutes: u32,
}

impl Engine {
    /// Create a reservation. Quota check, conflict check, insert and usage
    /// increment run in one unit of work holding the table lock, so concurrent
    /// requests for the same table are serialized and at most one of a set of
    /// overlapping requests succeeds. Transient store failures (including lock
    /// and attempt timeouts) are retried with exponential backoff.
    pub async fn book(&self, request: BookingRequest) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.book_with_retry(&request).await;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        metrics::histogram!(BOOKING_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn book_with_retry(&self, request: &BookingRequest) -> Result<Reservation, EngineError> {
        validate_party_size(request.party_size)?;
        let tenant = self.load_tenant(request.tenant_id).await?;
        let duration_minutes = self.resolve_duration(request.duration_minutes, &tenant)?;
        let start = self
            .tz
            .to_utc(request.local_date, request.local_time, &request.zone)?;
        if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
            return Err(ValidationError::OutOfRange.into());
        }
        let plan = Plan {
            id: Ulid::new(),
            span: Span::from_minutes(start, duration_minutes),
            duration_minutes,
        };

        let max_attempts = self.config.max_booking_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            metrics::counter!(BOOKING_ATTEMPTS_TOTAL).increment(1);

            let prepared = match tokio::time::timeout(
                self.config.attempt_timeout(),
                self.prepare_booking(request, &plan),
            )
            .await
            {
                Ok(prepared) => prepared,
                Err(_) => Err(AttemptError::Transient(TransientError::Timeout)),
            };
            // Commit runs outside the attempt timeout: once the log write is in
            // flight the attempt must finish one way or the other.
            let result = match prepared {
                Ok((uow, reservation)) => match uow.commit().await {
                    Ok(()) => Ok(reservation),
                    Err(e) => Err(AttemptError::from(e)),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(reservation) => {
                    info!(
                        reservation_id = %reservation.id,
                        tenant_id = %reservation.tenant_id,
                        table_id = %reservation.table_id,
                        start = reservation.start,
                        duration_minutes = reservation.duration_minutes,
                        attempt,
                        "reservation booked"
                    );
                    return Ok(reservation);
                }
                Err(AttemptError::Failed(e)) => {
                    debug!(table_id = %request.table_id, attempt, "booking rejected: {e}");
                    return Err(e);
                }
                Err(AttemptError::Transient(reason)) if attempt < max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    warn!(
                        table_id = %request.table_id,
                        attempt,
                        reason = reason.as_str(),
                        backoff_ms = backoff.as_millis() as u64,
                        "booking attempt failed, retrying"
                    );
                    metrics::counter!(BOOKING_RETRIES_TOTAL, "reason" => reason.as_str()).increment(1);
                    tokio::time::sleep(backoff).await;
                }
                Err(AttemptError::Transient(last)) => {
                    error!(
                        table_id = %request.table_id,
                        attempts = attempt,
                        reason = last.as_str(),
                        "booking retries exhausted"
                    );
                    return Err(EngineError::RetryExhausted {
                        attempts: attempt,
                        last,
                    });
                }
            }
        }
    }

    /// One attempt up to, but not including, commit. Returns the unit of work
    /// with the reservation and its usage increment staged.
    async fn prepare_booking(
        &self,
        request: &BookingRequest,
        plan: &Plan,
    ) -> Result<(Box<dyn UnitOfWork + '_>, Reservation), AttemptError> {
        let mut uow = self.store.begin(LockScope::Table(request.table_id)).await?;

        let table = uow
            .table()
            .cloned()
            .ok_or(EngineError::NotFound(request.table_id))?;
        if table.tenant_id != request.tenant_id {
            return Err(EngineError::NotFound(request.table_id).into());
        }
        if !table.fits(request.party_size) {
            return Err(ValidationError::Capacity {
                party_size: request.party_size,
                min: table.min_capacity,
                max: table.max_capacity,
            }
            .into());
        }

        let period = period_of(self.tz.today(&uow.tenant().timezone)?);
        let check = self
            .quota
            .check_in(uow.as_ref(), QuotaResource::Reservations, period);
        if let Some(denial) = check.denial() {
            return Err(EngineError::QuotaExceeded(denial).into());
        }

        let active = uow.active_reservations(&plan.span);
        if let Some(existing) = find_conflict(table.id, plan.span.start, plan.span.end, &active) {
            let window = self.conflict_window(existing, &request.zone)?;
            info!(
                table_id = %table.id,
                blocking = %existing.id,
                window = %window,
                "booking conflicts with existing reservation"
            );
            return Err(EngineError::Conflict(window).into());
        }

        let now = self.tz.now_ms();
        let reservation = Reservation {
            id: plan.id,
            tenant_id: request.tenant_id,
            table_id: table.id,
            guest_id: request.guest_id,
            start: plan.span.start,
            duration_minutes: plan.duration_minutes,
            party_size: request.party_size,
            status: ReservationStatus::Created,
            created_at: now,
            updated_at: now,
        };
        uow.insert_reservation(reservation.clone())?;
        self.quota
            .record_in(uow.as_mut(), QuotaResource::Reservations, 1, period)?;
        Ok((uow, reservation))
    }

    fn conflict_window(&self, existing: &Reservation, zone: &str) -> Result<ConflictWindow, TzError> {
        let (start_date, start_time) = self.tz.to_local(existing.start, zone)?;
        let (end_date, end_time) = self.tz.to_local(existing.end(), zone)?;
        Ok(ConflictWindow {
            reservation_id: existing.id,
            start: start_date.and_time(start_time),
            end: end_date.and_time(end_time),
        })
    }
}
