//! Per-tenant plan ceilings and usage accounting.
//!
//! `check_limit` is the check-before-act half; `increment_usage` is the
//! account-after-act half and must only run once the accounted action has
//! durably succeeded. Inside a booking both halves run on the booking's unit of
//! work, so the counter moves in the same commit as the reservation.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditLogEntry, AuditSink, SYSTEM_ACTOR};
use crate::engine::{validate_actor, EngineError, ValidationError};
use crate::limits::MAX_TABLE_NAME_LEN;
use crate::model::*;
use crate::store::{LockScope, Store, StoreError, UnitOfWork};
use crate::tz::TimeZoneConverter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Suspended,
    Inactive,
    LimitReached,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Suspended => "suspended",
            DenyReason::Inactive => "inactive",
            DenyReason::LimitReached => "limit_reached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub resource: QuotaResource,
    pub allowed: bool,
    pub current_usage: u64,
    pub limit: u64,
    pub reason: Option<DenyReason>,
    /// A higher plan tier would lift the ceiling above current usage.
    pub upgrade_available: bool,
}

impl LimitCheck {
    pub fn denial(&self) -> Option<QuotaDenial> {
        self.reason.map(|reason| QuotaDenial {
            resource: self.resource,
            current_usage: self.current_usage,
            limit: self.limit,
            reason,
            upgrade_available: self.upgrade_available,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDenial {
    pub resource: QuotaResource,
    pub current_usage: u64,
    pub limit: u64,
    pub reason: DenyReason,
    pub upgrade_available: bool,
}

impl std::fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}/{} ({})",
            self.resource.as_str(),
            self.current_usage,
            self.limit,
            self.reason.as_str()
        )
    }
}

/// Pure evaluation of one ceiling. An account outside trial/active is denied
/// regardless of numbers.
pub fn evaluate(
    tenant: &TenantRecord,
    usage: &TenantUsage,
    resource: QuotaResource,
    period: Period,
) -> LimitCheck {
    let current_usage = usage.as_of(period).current(resource);
    let limit = tenant.plan.limits().ceiling(resource);

    let reason = match tenant.status {
        AccountStatus::Suspended => Some(DenyReason::Suspended),
        AccountStatus::Inactive => Some(DenyReason::Inactive),
        AccountStatus::Trial | AccountStatus::Active if current_usage >= limit => {
            Some(DenyReason::LimitReached)
        }
        AccountStatus::Trial | AccountStatus::Active => None,
    };
    let upgrade_available = reason == Some(DenyReason::LimitReached)
        && PlanTier::ALL
            .iter()
            .any(|tier| *tier > tenant.plan && tier.limits().ceiling(resource) > current_usage);

    LimitCheck {
        resource,
        allowed: reason.is_none(),
        current_usage,
        limit,
        reason,
        upgrade_available,
    }
}

/// Plan defaults, overridden by tenant-specific flags.
pub fn feature_enabled(tenant: &TenantRecord, feature: Feature) -> bool {
    tenant
        .feature_overrides
        .get(&feature)
        .copied()
        .unwrap_or_else(|| tenant.plan.default_features().contains(&feature))
}

pub struct QuotaManager {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    tz: TimeZoneConverter,
}

impl QuotaManager {
    pub fn new(store: Arc<dyn Store>, audit: Arc<dyn AuditSink>, tz: TimeZoneConverter) -> Self {
        Self { store, audit, tz }
    }

    /// Current usage period in the tenant's zone.
    pub fn current_period(&self, tenant: &TenantRecord) -> Result<Period, EngineError> {
        Ok(period_of(self.tz.today(&tenant.timezone)?))
    }

    fn emit(&self, tenant_id: TenantId, action: AuditAction, performed_by: &str, details: serde_json::Value) {
        self.audit.record(AuditLogEntry::new(
            tenant_id,
            action,
            performed_by,
            details,
            self.tz.now_ms(),
        ));
    }

    fn note_denial(&self, tenant_id: TenantId, check: &LimitCheck) {
        let Some(denial) = check.denial() else {
            return;
        };
        warn!(
            tenant_id = %tenant_id,
            resource = denial.resource.as_str(),
            current = denial.current_usage,
            limit = denial.limit,
            reason = denial.reason.as_str(),
            "quota denied"
        );
        metrics::counter!(
            crate::observability::QUOTA_DENIALS_TOTAL,
            "resource" => denial.resource.as_str(),
            "reason" => denial.reason.as_str()
        )
        .increment(1);
        self.emit(
            tenant_id,
            AuditAction::QuotaDenied,
            SYSTEM_ACTOR,
            json!({
                "resource": denial.resource,
                "current_usage": denial.current_usage,
                "limit": denial.limit,
                "reason": denial.reason,
                "upgrade_available": denial.upgrade_available,
            }),
        );
    }

    pub async fn check_limit(
        &self,
        tenant_id: TenantId,
        resource: QuotaResource,
    ) -> Result<LimitCheck, EngineError> {
        let tenant = self
            .store
            .tenant(tenant_id)
            .await?
            .ok_or(EngineError::NotFound(tenant_id))?;
        let usage = self
            .store
            .usage(tenant_id)
            .await?
            .unwrap_or_else(|| TenantUsage::new(tenant_id, 0));
        let check = evaluate(&tenant, &usage, resource, self.current_period(&tenant)?);
        self.note_denial(tenant_id, &check);
        Ok(check)
    }

    /// Check against the counters held by an open unit of work.
    pub(crate) fn check_in(
        &self,
        uow: &dyn UnitOfWork,
        resource: QuotaResource,
        period: Period,
    ) -> LimitCheck {
        let check = evaluate(uow.tenant(), uow.usage(), resource, period);
        self.note_denial(uow.tenant().id, &check);
        check
    }

    /// Stage a counter increment on the unit of work that performs the accounted action.
    pub(crate) fn record_in(
        &self,
        uow: &mut dyn UnitOfWork,
        resource: QuotaResource,
        amount: u64,
        period: Period,
    ) -> Result<(), StoreError> {
        uow.record_usage(resource, amount, period)
    }

    /// Account for a resource created outside the core (staff, storage, ...).
    pub async fn increment_usage(
        &self,
        tenant_id: TenantId,
        resource: QuotaResource,
        amount: u64,
    ) -> Result<(), EngineError> {
        if amount == 0 {
            return Ok(());
        }
        let mut uow = self.store.begin(LockScope::Tenant(tenant_id)).await?;
        let period = self.current_period(uow.tenant())?;
        self.record_in(uow.as_mut(), resource, amount, period)?;
        uow.commit().await?;
        tracing::debug!(tenant_id = %tenant_id, resource = resource.as_str(), amount, "usage recorded");
        Ok(())
    }

    pub async fn is_feature_enabled(
        &self,
        tenant_id: TenantId,
        feature: Feature,
    ) -> Result<bool, EngineError> {
        let tenant = self
            .store
            .tenant(tenant_id)
            .await?
            .ok_or(EngineError::NotFound(tenant_id))?;
        Ok(feature_enabled(&tenant, feature))
    }

    // ── Tenant administration ────────────────────────────────

    pub async fn register_tenant(
        &self,
        tenant: TenantRecord,
        performed_by: &str,
    ) -> Result<(), EngineError> {
        validate_actor(performed_by)?;
        if tenant.name.is_empty() {
            return Err(ValidationError::Empty("tenant name").into());
        }
        if tenant.name.len() > MAX_TABLE_NAME_LEN {
            return Err(ValidationError::TooLong("tenant name").into());
        }
        TimeZoneConverter::parse_zone(&tenant.timezone)?;

        let period = self.current_period(&tenant)?;
        let tenant_id = tenant.id;
        let details = json!({
            "name": tenant.name,
            "plan": tenant.plan,
            "status": tenant.status,
            "timezone": tenant.timezone,
        });
        self.store
            .insert_tenant(tenant, TenantUsage::new(tenant_id, period))
            .await?;
        info!(tenant_id = %tenant_id, "tenant registered");
        self.emit(tenant_id, AuditAction::TenantRegistered, performed_by, details);
        Ok(())
    }

    /// Apply `change` to the tenant record in its own unit of work; returns (before, after).
    async fn update_tenant<F>(
        &self,
        tenant_id: TenantId,
        change: F,
    ) -> Result<(TenantRecord, TenantRecord), EngineError>
    where
        F: FnOnce(&mut TenantRecord) + Send,
    {
        let mut uow = self.store.begin(LockScope::Tenant(tenant_id)).await?;
        let before = uow.tenant().clone();
        let mut after = before.clone();
        change(&mut after);
        if after != before {
            uow.save_tenant(after.clone())?;
        }
        uow.commit().await?;
        Ok((before, after))
    }

    pub async fn change_plan(
        &self,
        tenant_id: TenantId,
        plan: PlanTier,
        performed_by: &str,
    ) -> Result<(), EngineError> {
        validate_actor(performed_by)?;
        let (before, after) = self
            .update_tenant(tenant_id, |t| t.plan = plan)
            .await?;
        info!(tenant_id = %tenant_id, from = before.plan.as_str(), to = after.plan.as_str(), "plan changed");
        self.emit(
            tenant_id,
            AuditAction::PlanChanged,
            performed_by,
            json!({ "before": before.plan, "after": after.plan }),
        );
        Ok(())
    }

    pub async fn suspend(
        &self,
        tenant_id: TenantId,
        reason: &str,
        performed_by: &str,
    ) -> Result<(), EngineError> {
        validate_actor(performed_by)?;
        let (before, after) = self
            .update_tenant(tenant_id, |t| t.status = AccountStatus::Suspended)
            .await?;
        warn!(tenant_id = %tenant_id, reason, "tenant suspended");
        self.emit(
            tenant_id,
            AuditAction::TenantSuspended,
            performed_by,
            json!({ "before": before.status, "after": after.status, "reason": reason }),
        );
        Ok(())
    }

    pub async fn reactivate(&self, tenant_id: TenantId, performed_by: &str) -> Result<(), EngineError> {
        validate_actor(performed_by)?;
        let (before, after) = self
            .update_tenant(tenant_id, |t| t.status = AccountStatus::Active)
            .await?;
        info!(tenant_id = %tenant_id, "tenant reactivated");
        self.emit(
            tenant_id,
            AuditAction::TenantReactivated,
            performed_by,
            json!({ "before": before.status, "after": after.status }),
        );
        Ok(())
    }

    /// `None` clears the override and falls back to the plan default.
    pub async fn set_feature_override(
        &self,
        tenant_id: TenantId,
        feature: Feature,
        enabled: Option<bool>,
        performed_by: &str,
    ) -> Result<(), EngineError> {
        validate_actor(performed_by)?;
        let (before, after) = self
            .update_tenant(tenant_id, |t| match enabled {
                Some(on) => {
                    t.feature_overrides.insert(feature, on);
                }
                None => {
                    t.feature_overrides.remove(&feature);
                }
            })
            .await?;
        self.emit(
            tenant_id,
            AuditAction::FeatureOverridden,
            performed_by,
            json!({
                "feature": feature,
                "before": feature_enabled(&before, feature),
                "after": feature_enabled(&after, feature),
                "override": enabled,
            }),
        );
        Ok(())
    }
}
