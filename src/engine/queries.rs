use chrono::{Duration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use super::availability::{rank_candidates, slot_grid};
use super::conflict::has_conflict;
use super::error::{EngineError, ValidationError};
use super::status::derive_status;
use super::{validate_party_size, Engine};
use crate::limits::{MAX_ALTERNATIVES, MINUTE_MS, RESERVED_LOOKAHEAD_MS};
use crate::model::*;
use crate::tz::{resolve_local, TimeZoneConverter};

/// Inbound availability query. Times are wall-clock in the tenant's zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityQuery {
    pub tenant_id: TenantId,
    pub date: NaiveDate,
    pub party_size: u32,
    pub preferred_time: Option<NaiveTime>,
    pub max_results: usize,
    /// Falls back to the tenant default, then the engine default.
    pub duration_minutes: Option<u32>,
}

impl Engine {
    /// Live status of every table of a tenant, sorted by table id. Recomputed on
    /// each call from the reservations around "now".
    pub async fn table_statuses(&self, tenant_id: TenantId) -> Result<Vec<TableStatusView>, EngineError> {
        self.load_tenant(tenant_id).await?;
        let now = self.tz.now_ms();
        let window = Span::new(now, now + RESERVED_LOOKAHEAD_MS);

        let tables = self.store.tables_for_tenant(tenant_id).await?;
        let mut views = Vec::with_capacity(tables.len());
        for table in tables {
            let mut reservations = self.store.reservations(table.id, window).await?;
            reservations.retain(Reservation::is_active);
            views.push(TableStatusView {
                table_id: table.id,
                status: derive_status(&table, now, &reservations),
                name: table.name,
            });
        }
        Ok(views)
    }

    /// Free (table, start) pairs on `query.date` for the party, nearest to the
    /// preferred time first, or in chronological order without one. An empty
    /// result means fully booked.
    pub async fn find_alternatives(&self, query: AvailabilityQuery) -> Result<Vec<SlotSuggestion>, EngineError> {
        validate_party_size(query.party_size)?;
        if query.max_results == 0 || query.max_results > MAX_ALTERNATIVES {
            return Err(ValidationError::MaxResults(MAX_ALTERNATIVES).into());
        }
        let tenant = self.load_tenant(query.tenant_id).await?;
        let tz = TimeZoneConverter::parse_zone(&tenant.timezone)?;
        let duration = self.resolve_duration(query.duration_minutes, &tenant)?;
        let now = self.tz.now_ms();

        // Slot starts as instants, in grid order; the past and DST-collapsed
        // duplicates drop out.
        let midnight = query.date.and_time(NaiveTime::MIN);
        let mut starts: Vec<Ms> = Vec::new();
        for offset in slot_grid(tenant.operating_hours.as_ref(), self.config.slot_step_minutes, duration) {
            let local = midnight
                .checked_add_signed(Duration::minutes(offset as i64))
                .ok_or(ValidationError::OutOfRange)?;
            let instant = resolve_local(local, tz)?;
            if instant > now && starts.last().is_none_or(|&last| instant > last) {
                starts.push(instant);
            }
        }
        let (Some(&first), Some(&last)) = (starts.first(), starts.last()) else {
            return Ok(Vec::new());
        };
        let span_ms = duration as Ms * MINUTE_MS;
        let window = Span::new(first, last + span_ms);

        let tables = self.store.tables_for_tenant(query.tenant_id).await?;
        let mut candidates = Vec::new();
        for table in tables.iter().filter(|t| !t.unavailable && t.fits(query.party_size)) {
            let mut reservations = self.store.reservations(table.id, window).await?;
            reservations.retain(Reservation::is_active);
            for &start in &starts {
                if has_conflict(table.id, start, start + span_ms, &reservations) {
                    continue;
                }
                let (date, time) = self.tz.to_local(start, &tenant.timezone)?;
                candidates.push(SlotSuggestion {
                    date,
                    time,
                    starts_at: start,
                    table_id: table.id,
                    table_name: table.name.clone(),
                    min_capacity: table.min_capacity,
                    max_capacity: table.max_capacity,
                });
            }
        }

        let preferred = match query.preferred_time {
            Some(t) => Some(resolve_local(query.date.and_time(t), tz)?),
            None => None,
        };
        Ok(rank_candidates(candidates, preferred, query.max_results))
    }

    /// Reservations of any status on a tenant's table overlapping `window`, by start.
    pub async fn reservations_for_table(
        &self,
        tenant_id: TenantId,
        table_id: TableId,
        window: Span,
    ) -> Result<Vec<Reservation>, EngineError> {
        match self.store.table(table_id).await? {
            Some(table) if table.tenant_id == tenant_id => {}
            _ => return Err(EngineError::NotFound(table_id)),
        }
        Ok(self.store.reservations(table_id, window).await?)
    }
}
