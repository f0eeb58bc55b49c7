use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};

use crate::limits::MAX_RESERVATION_SPAN_MS;
use crate::model::*;
use crate::wal::{encode_commit, Wal};

use super::{LockScope, Store, StoreError, TransientError, UnitOfWork};

pub type SharedTableState = Arc<RwLock<TableState>>;
pub type SharedTenantState = Arc<RwLock<TenantState>>;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

// ── Per-table and per-tenant state ───────────────────────

#[derive(Debug, Clone)]
pub struct TableState {
    pub table: Table,
    /// Every reservation ever made on the table, sorted by `start`.
    pub reservations: Vec<Reservation>,
}

impl TableState {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            reservations: Vec::new(),
        }
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.start <= reservation.start);
        self.reservations.insert(pos, reservation);
    }

    /// Reservations whose span overlaps `window`. Nothing lasts longer than
    /// `MAX_RESERVATION_SPAN_MS`, which bounds the scan on the left.
    pub fn overlapping(&self, window: &Span) -> impl Iterator<Item = &Reservation> {
        let (start, end) = (window.start, window.end);
        let left = self
            .reservations
            .partition_point(|r| r.start <= start.saturating_sub(MAX_RESERVATION_SPAN_MS));
        let right = self.reservations.partition_point(|r| r.start < end);
        self.reservations[left..right.max(left)]
            .iter()
            .filter(move |r| r.end() > start)
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::TableSaved { table } => self.table = table.clone(),
            Event::ReservationCreated { reservation } => {
                self.insert_reservation(reservation.clone())
            }
            Event::ReservationStatusChanged { id, status, at, .. } => {
                if let Some(r) = self.reservations.iter_mut().find(|r| r.id == *id) {
                    r.status = *status;
                    r.updated_at = *at;
                }
            }
            Event::TenantSaved { .. }
            | Event::UsageRecorded { .. }
            | Event::UsageRestored { .. } => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantState {
    pub record: TenantRecord,
    pub usage: TenantUsage,
}

impl TenantState {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::TenantSaved { tenant } => self.record = tenant.clone(),
            Event::UsageRecorded {
                resource,
                amount,
                period,
                ..
            } => self.usage.apply(*resource, *amount, *period),
            Event::UsageRestored { usage } => self.usage = usage.clone(),
            Event::TableSaved { .. }
            | Event::ReservationCreated { .. }
            | Event::ReservationStatusChanged { .. } => {}
        }
    }
}

enum EventTarget {
    Tenant(TenantId),
    Table(TableId),
}

fn event_target(event: &Event) -> EventTarget {
    match event {
        Event::TenantSaved { tenant } => EventTarget::Tenant(tenant.id),
        Event::UsageRecorded { tenant_id, .. } => EventTarget::Tenant(*tenant_id),
        Event::UsageRestored { usage } => EventTarget::Tenant(usage.tenant_id),
        Event::TableSaved { table } => EventTarget::Table(table.id),
        Event::ReservationCreated { reservation } => EventTarget::Table(reservation.table_id),
        Event::ReservationStatusChanged { table_id, .. } => EventTarget::Table(*table_id),
    }
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are written
/// together and made durable by a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response))
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    // One frame per unit of work. A commit that fails to encode is refused on
    // its own and never reaches the file.
    let mut frames = Vec::new();
    let mut accepted = Vec::with_capacity(batch.len());
    for (events, tx) in batch {
        match encode_commit(&mut frames, &events) {
            Ok(()) => accepted.push(tx),
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    }
    if accepted.is_empty() {
        return;
    }

    let result = wal.append_commits(&frames, accepted.len() as u64);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for tx in accepted {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => flush_and_respond(wal, vec![(events, response)]),
    }
}

// ── Store ────────────────────────────────────────────────

/// In-process store. Table state sits behind a per-table `RwLock`, tenant state
/// behind a per-tenant one; a unit of work holds the write guards until it
/// commits or drops. With a WAL, commits are durable before they become visible.
pub struct MemoryStore {
    tenants: DashMap<TenantId, SharedTenantState>,
    tables: DashMap<TableId, SharedTableState>,
    tenant_tables: DashMap<TenantId, Vec<TableId>>,
    reservation_to_table: DashMap<ReservationId, TableId>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Held shared by every open unit of work, exclusively by compaction.
    gate: Arc<RwLock<()>>,
    registration: Mutex<()>,
    lock_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store without a log.
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
            tables: DashMap::new(),
            tenant_tables: DashMap::new(),
            reservation_to_table: DashMap::new(),
            wal_tx: None,
            gate: Arc::new(RwLock::new(())),
            registration: Mutex::new(()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Replay the log at `path` and keep appending to it. Must be called inside a
    /// tokio runtime: the WAL writer runs as a spawned task.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut store = Self::new();
        store.wal_tx = Some(wal_tx);
        store.rebuild(&events);
        info!(
            path = %path.display(),
            events = events.len(),
            tenants = store.tenants.len(),
            tables = store.tables.len(),
            "store replayed"
        );
        Ok(store)
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    fn rebuild(&mut self, events: &[Event]) {
        let mut tenants: HashMap<TenantId, TenantState> = HashMap::new();
        let mut tables: HashMap<TableId, TableState> = HashMap::new();

        for event in events {
            match event_target(event) {
                EventTarget::Tenant(id) => {
                    if let Event::TenantSaved { tenant } = event {
                        tenants.entry(id).or_insert_with(|| TenantState {
                            record: tenant.clone(),
                            usage: TenantUsage::new(id, 0),
                        });
                    }
                    if let Some(state) = tenants.get_mut(&id) {
                        state.apply(event);
                    }
                }
                EventTarget::Table(id) => {
                    if let Event::TableSaved { table } = event {
                        tables
                            .entry(id)
                            .or_insert_with(|| TableState::new(table.clone()));
                    }
                    if let Some(state) = tables.get_mut(&id) {
                        state.apply(event);
                    }
                }
            }
        }

        for (id, state) in tenants {
            self.tenants.insert(id, Arc::new(RwLock::new(state)));
        }
        for (_, state) in tables {
            self.attach_table(state);
        }
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
    }

    fn attach_table(&self, state: TableState) {
        let table_id = state.table.id;
        let tenant_id = state.table.tenant_id;
        for r in &state.reservations {
            self.reservation_to_table.insert(r.id, table_id);
        }
        self.tables.insert(table_id, Arc::new(RwLock::new(state)));
        let mut ids = self.tenant_tables.entry(tenant_id).or_default();
        if let Err(pos) = ids.binary_search(&table_id) {
            ids.insert(pos, table_id);
        }
    }

    fn table_state(&self, id: &TableId) -> Option<SharedTableState> {
        self.tables.get(id).map(|e| e.value().clone())
    }

    fn tenant_state(&self, id: &TenantId) -> Option<SharedTenantState> {
        self.tenants.get(id).map(|e| e.value().clone())
    }

    /// Bound a lock wait. Running out of time is transient: the caller may retry.
    async fn timed<F: Future>(&self, fut: F) -> Result<F::Output, StoreError> {
        tokio::time::timeout(self.lock_timeout, fut)
            .await
            .map_err(|_| StoreError::Transient(TransientError::Timeout))
    }

    async fn wal_append(&self, events: &[Event]) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Persistence("WAL writer dropped response".into()))??;
        Ok(())
    }

    /// Rewrite the log with only the events needed to recreate current state.
    /// Waits for open units of work to finish and blocks new ones meanwhile.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _gate = self.gate.write().await;

        let mut events = Vec::new();
        let tenants: Vec<SharedTenantState> = self.tenants.iter().map(|e| e.value().clone()).collect();
        for state in tenants {
            let guard = state.read().await;
            events.push(Event::TenantSaved {
                tenant: guard.record.clone(),
            });
            events.push(Event::UsageRestored {
                usage: guard.usage.clone(),
            });
        }
        let tables: Vec<SharedTableState> = self.tables.iter().map(|e| e.value().clone()).collect();
        for state in tables {
            let guard = state.read().await;
            events.push(Event::TableSaved {
                table: guard.table.clone(),
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: r.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Persistence("WAL writer dropped response".into()))??;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin<'a>(&'a self, scope: LockScope) -> Result<Box<dyn UnitOfWork + 'a>, StoreError> {
        let gate = self.timed(self.gate.clone().read_owned()).await?;

        let (table, tenant_id) = match scope {
            LockScope::Table(id) => {
                let state = self.table_state(&id).ok_or(StoreError::NotFound(id))?;
                let guard = self.timed(state.write_owned()).await?;
                let tenant_id = guard.table.tenant_id;
                (Some(guard), tenant_id)
            }
            LockScope::Tenant(id) => (None, id),
        };
        let state = self
            .tenant_state(&tenant_id)
            .ok_or(StoreError::NotFound(tenant_id))?;
        let tenant = self.timed(state.write_owned()).await?;

        Ok(Box::new(MemoryUnitOfWork {
            store: self,
            _gate: gate,
            table,
            tenant,
            pending: Vec::new(),
            finished: false,
        }))
    }

    async fn insert_tenant(&self, tenant: TenantRecord, usage: TenantUsage) -> Result<(), StoreError> {
        let _registration = self.registration.lock().await;
        let _gate = self.timed(self.gate.clone().read_owned()).await?;
        if self.tenants.contains_key(&tenant.id) {
            return Err(StoreError::AlreadyExists(tenant.id));
        }
        let events = [
            Event::TenantSaved {
                tenant: tenant.clone(),
            },
            Event::UsageRestored {
                usage: usage.clone(),
            },
        ];
        self.wal_append(&events).await?;
        self.tenants.insert(
            tenant.id,
            Arc::new(RwLock::new(TenantState {
                record: tenant,
                usage,
            })),
        );
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(())
    }

    async fn tenant(&self, id: TenantId) -> Result<Option<TenantRecord>, StoreError> {
        match self.tenant_state(&id) {
            Some(state) => Ok(Some(state.read().await.record.clone())),
            None => Ok(None),
        }
    }

    async fn usage(&self, id: TenantId) -> Result<Option<TenantUsage>, StoreError> {
        match self.tenant_state(&id) {
            Some(state) => Ok(Some(state.read().await.usage.clone())),
            None => Ok(None),
        }
    }

    async fn table(&self, id: TableId) -> Result<Option<Table>, StoreError> {
        match self.table_state(&id) {
            Some(state) => Ok(Some(state.read().await.table.clone())),
            None => Ok(None),
        }
    }

    async fn tables_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Table>, StoreError> {
        let ids: Vec<TableId> = self
            .tenant_tables
            .get(&tenant_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut tables = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(state) = self.table_state(&id) {
                tables.push(state.read().await.table.clone());
            }
        }
        Ok(tables)
    }

    async fn reservations(&self, table_id: TableId, window: Span) -> Result<Vec<Reservation>, StoreError> {
        let state = self
            .table_state(&table_id)
            .ok_or(StoreError::NotFound(table_id))?;
        let guard = state.read().await;
        Ok(guard.overlapping(&window).cloned().collect())
    }

    async fn table_for_reservation(&self, id: ReservationId) -> Result<Option<TableId>, StoreError> {
        Ok(self.reservation_to_table.get(&id).map(|e| *e.value()))
    }
}

// ── Unit of work ─────────────────────────────────────────

pub struct MemoryUnitOfWork<'a> {
    store: &'a MemoryStore,
    _gate: OwnedRwLockReadGuard<()>,
    table: Option<OwnedRwLockWriteGuard<TableState>>,
    tenant: OwnedRwLockWriteGuard<TenantState>,
    pending: Vec<Event>,
    finished: bool,
}

impl MemoryUnitOfWork<'_> {
    fn locked_table(&self, id: TableId) -> Result<&TableState, StoreError> {
        match &self.table {
            Some(guard) if guard.table.id == id => Ok(&**guard),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    fn apply(&mut self, event: &Event) {
        match event_target(event) {
            EventTarget::Tenant(_) => self.tenant.apply(event),
            EventTarget::Table(id) => match self.table.as_mut() {
                Some(guard) if guard.table.id == id => {
                    guard.apply(event);
                    if let Event::ReservationCreated { reservation } = event {
                        self.store.reservation_to_table.insert(reservation.id, id);
                    }
                }
                _ => {
                    if let Event::TableSaved { table } = event {
                        self.store.attach_table(TableState::new(table.clone()));
                    }
                }
            },
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork<'_> {
    fn tenant(&self) -> &TenantRecord {
        &self.tenant.record
    }

    fn usage(&self) -> &TenantUsage {
        &self.tenant.usage
    }

    fn table(&self) -> Option<&Table> {
        self.table.as_ref().map(|g| &g.table)
    }

    fn active_reservations(&self, window: &Span) -> Vec<Reservation> {
        match &self.table {
            Some(guard) => guard
                .overlapping(window)
                .filter(|r| r.is_active())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.table
            .as_ref()
            .and_then(|g| g.reservations.iter().find(|r| r.id == id))
    }

    fn insert_reservation(&mut self, reservation: Reservation) -> Result<(), StoreError> {
        let state = self.locked_table(reservation.table_id)?;
        if state.table.tenant_id != self.tenant.record.id {
            return Err(StoreError::NotFound(reservation.table_id));
        }
        if self.store.reservation_to_table.contains_key(&reservation.id)
            || self.pending.iter().any(|e| {
                matches!(e, Event::ReservationCreated { reservation: r } if r.id == reservation.id)
            })
        {
            return Err(StoreError::AlreadyExists(reservation.id));
        }
        self.pending.push(Event::ReservationCreated { reservation });
        Ok(())
    }

    fn set_reservation_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        at: Ms,
    ) -> Result<(), StoreError> {
        let table_id = match &self.table {
            Some(guard) if guard.reservations.iter().any(|r| r.id == id) => guard.table.id,
            _ => return Err(StoreError::NotFound(id)),
        };
        self.pending.push(Event::ReservationStatusChanged {
            id,
            table_id,
            status,
            at,
        });
        Ok(())
    }

    fn save_table(&mut self, table: Table) -> Result<(), StoreError> {
        if table.tenant_id != self.tenant.record.id {
            return Err(StoreError::NotFound(table.tenant_id));
        }
        let locked = self.table.as_ref().is_some_and(|g| g.table.id == table.id);
        if !locked && self.store.tables.contains_key(&table.id) {
            return Err(StoreError::Persistence(format!(
                "table {} is not locked by this unit of work",
                table.id
            )));
        }
        self.pending.push(Event::TableSaved { table });
        Ok(())
    }

    fn save_tenant(&mut self, tenant: TenantRecord) -> Result<(), StoreError> {
        if tenant.id != self.tenant.record.id {
            return Err(StoreError::NotFound(tenant.id));
        }
        self.pending.push(Event::TenantSaved { tenant });
        Ok(())
    }

    fn record_usage(
        &mut self,
        resource: QuotaResource,
        amount: u64,
        period: Period,
    ) -> Result<(), StoreError> {
        self.pending.push(Event::UsageRecorded {
            tenant_id: self.tenant.record.id,
            resource,
            amount,
            period,
        });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let events = std::mem::take(&mut self.pending);
        self.finished = true;
        if events.is_empty() {
            return Ok(());
        }
        self.store.wal_append(&events).await?;
        for event in &events {
            self.apply(event);
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        self.pending.clear();
        self.finished = true;
    }
}

impl Drop for MemoryUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.pending.is_empty() {
            debug!(
                tenant_id = %self.tenant.record.id,
                discarded = self.pending.len(),
                "unit of work dropped without commit"
            );
        }
    }
}
