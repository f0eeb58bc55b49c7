//! Storage seam for the scheduling core.
//!
//! Every mutation goes through a [`UnitOfWork`]: `Store::begin` acquires the locks
//! for a [`LockScope`], writes are staged on the unit, and `commit` makes them
//! durable and visible together. Dropping a unit without committing rolls it back
//! and releases its locks.

pub mod compactor;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

pub use memory::MemoryStore;

/// Failures worth retrying: the same unit of work may succeed on a fresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransientError {
    #[error("serialization failure")]
    SerializationFailure,
    #[error("deadlock detected")]
    Deadlock,
    #[error("timed out")]
    Timeout,
}

impl TransientError {
    pub fn as_str(self) -> &'static str {
        match self {
            TransientError::SerializationFailure => "serialization_failure",
            TransientError::Deadlock => "deadlock",
            TransientError::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Persistence(e.to_string())
    }
}

/// What a unit of work locks. A table scope also locks the owning tenant
/// (always table first, then tenant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Table(TableId),
    Tenant(TenantId),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin<'a>(&'a self, scope: LockScope) -> Result<Box<dyn UnitOfWork + 'a>, StoreError>;

    /// Register a tenant with fresh usage counters. Fails with `AlreadyExists`.
    async fn insert_tenant(&self, tenant: TenantRecord, usage: TenantUsage) -> Result<(), StoreError>;

    async fn tenant(&self, id: TenantId) -> Result<Option<TenantRecord>, StoreError>;

    async fn usage(&self, id: TenantId) -> Result<Option<TenantUsage>, StoreError>;

    async fn table(&self, id: TableId) -> Result<Option<Table>, StoreError>;

    /// Tables of a tenant, sorted by id.
    async fn tables_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Table>, StoreError>;

    /// Reservations of any status on a table whose span overlaps `window`, sorted by start.
    async fn reservations(&self, table_id: TableId, window: Span) -> Result<Vec<Reservation>, StoreError>;

    async fn table_for_reservation(&self, id: ReservationId) -> Result<Option<TableId>, StoreError>;
}

#[async_trait]
pub trait UnitOfWork: Send {
    /// Committed tenant record, read under the tenant lock.
    fn tenant(&self) -> &TenantRecord;

    /// Committed usage counters, read under the tenant lock.
    fn usage(&self) -> &TenantUsage;

    /// The locked table, for table scopes.
    fn table(&self) -> Option<&Table>;

    /// Active reservations on the locked table overlapping `window`.
    fn active_reservations(&self, window: &Span) -> Vec<Reservation>;

    fn reservation(&self, id: ReservationId) -> Option<&Reservation>;

    fn insert_reservation(&mut self, reservation: Reservation) -> Result<(), StoreError>;

    fn set_reservation_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        at: Ms,
    ) -> Result<(), StoreError>;

    fn save_table(&mut self, table: Table) -> Result<(), StoreError>;

    fn save_tenant(&mut self, tenant: TenantRecord) -> Result<(), StoreError>;

    fn record_usage(
        &mut self,
        resource: QuotaResource,
        amount: u64,
        period: Period,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard staged writes and release locks. Dropping the unit does the same.
    fn rollback(self: Box<Self>);
}
