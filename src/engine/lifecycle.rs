use serde_json::json;
use tracing::info;
use ulid::Ulid;

use super::error::{EngineError, ValidationError};
use super::{validate_actor, Engine};
use crate::audit::AuditAction;
use crate::limits::{MAX_PARTY_SIZE, MAX_TABLE_NAME_LEN};
use crate::model::*;
use crate::observability::STATUS_TRANSITIONS_TOTAL;
use crate::store::LockScope;

impl Engine {
    /// Move a reservation along its lifecycle. Reservations are never removed;
    /// cancellation and archival are transitions like any other. Another
    /// tenant's reservation is reported as not found.
    pub async fn transition(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        to: ReservationStatus,
        performed_by: &str,
    ) -> Result<Reservation, EngineError> {
        validate_actor(performed_by)?;
        let table_id = self
            .store
            .table_for_reservation(reservation_id)
            .await?
            .ok_or(EngineError::NotFound(reservation_id))?;

        let mut uow = self.store.begin(LockScope::Table(table_id)).await?;
        let mut reservation = uow
            .reservation(reservation_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))?;
        let from = reservation.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }

        let now = self.tz.now_ms();
        uow.set_reservation_status(reservation_id, to, now)?;
        uow.commit().await?;
        reservation.status = to;
        reservation.updated_at = now;

        metrics::counter!(STATUS_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        info!(
            reservation_id = %reservation_id,
            table_id = %table_id,
            from = from.as_str(),
            to = to.as_str(),
            "reservation status changed"
        );
        self.emit_audit(
            reservation.tenant_id,
            AuditAction::ReservationStatusChanged,
            performed_by,
            json!({
                "reservation_id": reservation_id.to_string(),
                "table_id": table_id.to_string(),
                "before": from,
                "after": to,
            }),
        );
        Ok(reservation)
    }

    /// Add a table, counting it against the tenant's table ceiling in the same
    /// unit of work.
    pub async fn create_table(
        &self,
        tenant_id: TenantId,
        name: &str,
        min_capacity: u32,
        max_capacity: u32,
        performed_by: &str,
    ) -> Result<Table, EngineError> {
        validate_actor(performed_by)?;
        if name.is_empty() {
            return Err(ValidationError::Empty("table name").into());
        }
        if name.len() > MAX_TABLE_NAME_LEN {
            return Err(ValidationError::TooLong("table name").into());
        }
        if min_capacity == 0 || min_capacity > max_capacity || max_capacity > MAX_PARTY_SIZE {
            return Err(ValidationError::CapacityRange {
                min: min_capacity,
                max: max_capacity,
            }
            .into());
        }

        let mut uow = self.store.begin(LockScope::Tenant(tenant_id)).await?;
        let period = period_of(self.tz.today(&uow.tenant().timezone)?);
        let check = self.quota.check_in(uow.as_ref(), QuotaResource::Tables, period);
        if let Some(denial) = check.denial() {
            return Err(EngineError::QuotaExceeded(denial));
        }

        let table = Table {
            id: Ulid::new(),
            tenant_id,
            name: name.to_string(),
            min_capacity,
            max_capacity,
            unavailable: false,
        };
        uow.save_table(table.clone())?;
        self.quota
            .record_in(uow.as_mut(), QuotaResource::Tables, 1, period)?;
        uow.commit().await?;

        info!(tenant_id = %tenant_id, table_id = %table.id, name, "table created");
        self.emit_audit(
            tenant_id,
            AuditAction::TableCreated,
            performed_by,
            json!({
                "table_id": table.id.to_string(),
                "name": table.name,
                "min_capacity": min_capacity,
                "max_capacity": max_capacity,
            }),
        );
        Ok(table)
    }

    /// Set or clear the administrative "unavailable" override on one of the
    /// tenant's tables.
    pub async fn set_table_unavailable(
        &self,
        tenant_id: TenantId,
        table_id: TableId,
        unavailable: bool,
        performed_by: &str,
    ) -> Result<Table, EngineError> {
        validate_actor(performed_by)?;
        let mut uow = self.store.begin(LockScope::Table(table_id)).await?;
        let mut table = uow
            .table()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .ok_or(EngineError::NotFound(table_id))?;
        if table.unavailable == unavailable {
            uow.rollback();
            return Ok(table);
        }
        table.unavailable = unavailable;
        uow.save_table(table.clone())?;
        uow.commit().await?;

        info!(table_id = %table_id, unavailable, "table availability changed");
        self.emit_audit(
            table.tenant_id,
            AuditAction::TableAvailabilityChanged,
            performed_by,
            json!({ "table_id": table_id.to_string(), "before": !unavailable, "after": unavailable }),
        );
        Ok(table)
    }
}
