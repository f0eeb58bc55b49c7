mod availability;
mod booking;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod status;
#[cfg(test)]
mod tests;

pub use availability::{rank_candidates, slot_grid};
pub use booking::BookingRequest;
pub use conflict::{find_conflict, has_conflict};
pub use error::{ConflictWindow, EngineError, ValidationError};
pub use queries::AvailabilityQuery;
pub use status::derive_status;

use std::sync::Arc;

use tracing::info;

use crate::audit::{AuditAction, AuditLogEntry, AuditSink, TracingAuditSink};
use crate::config::EngineConfig;
use crate::limits::{MAX_DURATION_MINUTES, MAX_PARTY_SIZE, MAX_PERFORMED_BY_LEN};
use crate::model::*;
use crate::quota::QuotaManager;
use crate::store::{MemoryStore, Store};
use crate::tz::TimeZoneConverter;

/// Scheduling core. One instance serves every tenant; all shared state lives in
/// the [`Store`], so an `Engine` is cheap to wrap in an `Arc` and share.
pub struct Engine {
    store: Arc<dyn Store>,
    tz: TimeZoneConverter,
    quota: Arc<QuotaManager>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
        tz: TimeZoneConverter,
        config: EngineConfig,
    ) -> Self {
        let quota = Arc::new(QuotaManager::new(store.clone(), audit.clone(), tz.clone()));
        Self {
            store,
            tz,
            quota,
            audit,
            config,
        }
    }

    /// Build an engine over the bundled store: WAL-backed when `data_dir` is set
    /// (a compactor task is spawned for it), volatile otherwise. Audit records go
    /// to `tracing`. Must be called inside a tokio runtime.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let store = match config.wal_path() {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)
                        .map_err(|e| EngineError::Persistence(e.to_string()))?;
                }
                let store = Arc::new(
                    MemoryStore::open(&path)
                        .map_err(|e| EngineError::Persistence(e.to_string()))?
                        .with_lock_timeout(config.lock_timeout()),
                );
                let compactor = store.clone();
                let threshold = config.compact_threshold;
                tokio::spawn(async move {
                    crate::store::compactor::run_compactor(compactor, threshold).await;
                });
                info!(path = %path.display(), "engine opened with write-ahead log");
                store
            }
            None => Arc::new(MemoryStore::new().with_lock_timeout(config.lock_timeout())),
        };
        Ok(Self::new(
            store,
            Arc::new(TracingAuditSink),
            TimeZoneConverter::system(),
            config,
        ))
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub fn tz(&self) -> &TimeZoneConverter {
        &self.tz
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ── Shared helpers ───────────────────────────────────────

    async fn load_tenant(&self, tenant_id: TenantId) -> Result<TenantRecord, EngineError> {
        self.store
            .tenant(tenant_id)
            .await?
            .ok_or(EngineError::NotFound(tenant_id))
    }

    /// Explicit value, else the tenant's default, else the configured default.
    fn resolve_duration(
        &self,
        requested: Option<u32>,
        tenant: &TenantRecord,
    ) -> Result<u32, ValidationError> {
        let duration = requested
            .or(tenant.default_duration_minutes)
            .unwrap_or(self.config.default_duration_minutes);
        if duration == 0 || duration > MAX_DURATION_MINUTES {
            return Err(ValidationError::Duration {
                got: duration,
                max: MAX_DURATION_MINUTES,
            });
        }
        Ok(duration)
    }

    fn emit_audit(
        &self,
        tenant_id: TenantId,
        action: AuditAction,
        performed_by: &str,
        details: serde_json::Value,
    ) {
        self.audit.record(AuditLogEntry::new(
            tenant_id,
            action,
            performed_by,
            details,
            self.tz.now_ms(),
        ));
    }
}

fn validate_party_size(party_size: u32) -> Result<(), ValidationError> {
    if party_size == 0 || party_size > MAX_PARTY_SIZE {
        return Err(ValidationError::PartySize {
            got: party_size,
            max: MAX_PARTY_SIZE,
        });
    }
    Ok(())
}

pub(crate) fn validate_actor(performed_by: &str) -> Result<(), ValidationError> {
    if performed_by.is_empty() {
        return Err(ValidationError::Empty("performed_by"));
    }
    if performed_by.len() > MAX_PERFORMED_BY_LEN {
        return Err(ValidationError::TooLong("performed_by"));
    }
    Ok(())
}
