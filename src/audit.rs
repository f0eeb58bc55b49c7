use dashmap::DashMap;
use serde::Serialize;
use ulid::Ulid;

use crate::model::{Ms, TenantId};

/// Actor recorded for actions the core takes on its own (e.g. quota denials).
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TenantRegistered,
    PlanChanged,
    TenantSuspended,
    TenantReactivated,
    FeatureOverridden,
    QuotaDenied,
    TableCreated,
    TableAvailabilityChanged,
    ReservationStatusChanged,
}

/// Append-only record. Never mutated after it is handed to a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditLogEntry {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub action: AuditAction,
    pub performed_by: String,
    pub details: serde_json::Value,
    pub timestamp: Ms,
}

impl AuditLogEntry {
    pub fn new(
        tenant_id: TenantId,
        action: AuditAction,
        performed_by: &str,
        details: serde_json::Value,
        timestamp: Ms,
    ) -> Self {
        Self {
            id: Ulid::new(),
            tenant_id,
            action,
            performed_by: performed_by.to_string(),
            details,
            timestamp,
        }
    }
}

/// Outbound audit log. Storage format belongs to the implementor.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditLogEntry);
}

/// Emits each entry as a structured `tracing` event on the `seatlock::audit` target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditLogEntry) {
        tracing::info!(
            target: "seatlock::audit",
            id = %entry.id,
            tenant_id = %entry.tenant_id,
            action = ?entry.action,
            performed_by = %entry.performed_by,
            details = %entry.details,
            timestamp = entry.timestamp,
            "audit"
        );
    }
}

/// Keeps entries in memory, per tenant, in arrival order.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: DashMap<TenantId, Vec<AuditLogEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, tenant_id: TenantId) -> Vec<AuditLogEntry> {
        self.entries
            .get(&tenant_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn actions(&self, tenant_id: TenantId) -> Vec<AuditAction> {
        self.entries(tenant_id).iter().map(|e| e.action).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditLogEntry) {
        self.entries.entry(entry.tenant_id).or_default().push(entry);
    }
}
