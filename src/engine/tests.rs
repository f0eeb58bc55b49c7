use super::*;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use ulid::Ulid;

use crate::audit::MemoryAuditSink;
use crate::limits::*;
use crate::quota::DenyReason;
use crate::store::{LockScope, StoreError, TransientError, UnitOfWork};
use crate::tz::ManualClock;

const ZONE: &str = "Europe/Moscow";

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp_millis()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// 2025-06-01 09:00 UTC, 12:00 in Moscow.
fn start_of_test() -> Ms {
    utc(2025, 6, 1, 9, 0)
}

fn today() -> NaiveDate {
    date(2025, 6, 1)
}

fn tomorrow() -> NaiveDate {
    date(2025, 6, 2)
}

fn test_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_base_ms: 1,
        ..Default::default()
    }
}

struct Fixture {
    engine: Arc<Engine>,
    store: Arc<dyn Store>,
    audit: Arc<MemoryAuditSink>,
    clock: Arc<ManualClock>,
}

fn fixture() -> Fixture {
    fixture_over(Arc::new(MemoryStore::new()), test_config())
}

fn fixture_over(store: Arc<dyn Store>, config: EngineConfig) -> Fixture {
    let audit = Arc::new(MemoryAuditSink::new());
    let clock = Arc::new(ManualClock::new(start_of_test()));
    let engine = Arc::new(Engine::new(
        store.clone(),
        audit.clone(),
        TimeZoneConverter::new(clock.clone()),
        config,
    ));
    Fixture {
        engine,
        store,
        audit,
        clock,
    }
}

fn tenant_record(plan: PlanTier, hours: Option<(NaiveTime, NaiveTime)>) -> TenantRecord {
    TenantRecord {
        id: Ulid::new(),
        name: "Pelmennaya".into(),
        timezone: ZONE.into(),
        plan,
        status: AccountStatus::Active,
        feature_overrides: BTreeMap::new(),
        operating_hours: hours.map(|(open, close)| OperatingHours { open, close }),
        default_duration_minutes: None,
    }
}

async fn register(f: &Fixture, plan: PlanTier, hours: Option<(NaiveTime, NaiveTime)>) -> TenantId {
    let record = tenant_record(plan, hours);
    let id = record.id;
    f.engine.quota().register_tenant(record, "owner").await.unwrap();
    id
}

async fn table(f: &Fixture, tenant_id: TenantId, name: &str, min: u32, max: u32) -> Table {
    f.engine
        .create_table(tenant_id, name, min, max, "owner")
        .await
        .unwrap()
}

fn request(
    tenant_id: TenantId,
    table_id: TableId,
    day: NaiveDate,
    at: NaiveTime,
    minutes: u32,
) -> BookingRequest {
    BookingRequest {
        tenant_id,
        table_id,
        guest_id: Ulid::new(),
        local_date: day,
        local_time: at,
        zone: ZONE.into(),
        duration_minutes: Some(minutes),
        party_size: 2,
    }
}

async fn month_reservations(f: &Fixture, tenant_id: TenantId) -> u64 {
    f.store.usage(tenant_id).await.unwrap().unwrap().month_reservations
}

// ── Fault injection ──────────────────────────────────────

/// Wraps a `MemoryStore` and fails or stalls table-scoped `begin` calls on demand.
struct FlakyStore {
    inner: MemoryStore,
    transient_failures: AtomicU32,
    transient: TransientError,
    stalls: AtomicU32,
    stall_for: Duration,
    broken: AtomicBool,
    table_begins: AtomicU32,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            transient_failures: AtomicU32::new(0),
            transient: TransientError::SerializationFailure,
            stalls: AtomicU32::new(0),
            stall_for: Duration::from_millis(200),
            broken: AtomicBool::new(false),
            table_begins: AtomicU32::new(0),
        }
    }

    fn failing(mut self, n: u32, kind: TransientError) -> Self {
        self.transient_failures = AtomicU32::new(n);
        self.transient = kind;
        self
    }

    fn stalling(self, n: u32) -> Self {
        self.stalls.store(n, Ordering::SeqCst);
        self
    }

    fn broken(self) -> Self {
        self.broken.store(true, Ordering::SeqCst);
        self
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn begin<'a>(&'a self, scope: LockScope) -> Result<Box<dyn UnitOfWork + 'a>, StoreError> {
        if matches!(scope, LockScope::Table(_)) {
            self.table_begins.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Persistence("disk unavailable".into()));
            }
            if Self::take(&self.transient_failures) {
                return Err(StoreError::Transient(self.transient));
            }
            if Self::take(&self.stalls) {
                tokio::time::sleep(self.stall_for).await;
            }
        }
        self.inner.begin(scope).await
    }

    async fn insert_tenant(&self, tenant: TenantRecord, usage: TenantUsage) -> Result<(), StoreError> {
        self.inner.insert_tenant(tenant, usage).await
    }

    async fn tenant(&self, id: TenantId) -> Result<Option<TenantRecord>, StoreError> {
        self.inner.tenant(id).await
    }

    async fn usage(&self, id: TenantId) -> Result<Option<TenantUsage>, StoreError> {
        self.inner.usage(id).await
    }

    async fn table(&self, id: TableId) -> Result<Option<Table>, StoreError> {
        self.inner.table(id).await
    }

    async fn tables_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Table>, StoreError> {
        self.inner.tables_for_tenant(tenant_id).await
    }

    async fn reservations(&self, table_id: TableId, window: Span) -> Result<Vec<Reservation>, StoreError> {
        self.inner.reservations(table_id, window).await
    }

    async fn table_for_reservation(&self, id: ReservationId) -> Result<Option<TableId>, StoreError> {
        self.inner.table_for_reservation(id).await
    }
}

async fn flaky_fixture(store: FlakyStore, config: EngineConfig) -> (Fixture, Arc<FlakyStore>, TenantId, Table) {
    let flaky = Arc::new(store);
    let f = fixture_over(flaky.clone(), config);
    let tid = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;
    (f, flaky, tid, t)
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn moscow_conflict_and_adjacent_booking() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, tid, "Window", 2, 4).await;

    let first = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 120))
        .await
        .unwrap();
    assert_eq!(first.start, utc(2025, 6, 2, 16, 0));
    assert_eq!(first.status, ReservationStatus::Created);

    let err = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(20, 0), 120))
        .await
        .unwrap_err();
    match &err {
        EngineError::Conflict(window) => {
            assert_eq!(window.reservation_id, first.id);
            assert_eq!(window.to_string(), "19:00–21:00");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(err.to_string(), "table busy 19:00–21:00");

    let adjacent = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(21, 0), 90))
        .await
        .unwrap();
    assert_eq!(adjacent.start, first.end());
    assert_eq!(month_reservations(&f, tid).await, 2);
}

#[tokio::test]
async fn conflict_window_shown_in_request_zone() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;
    f.engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 120))
        .await
        .unwrap();

    // 16:30 UTC is inside 16:00-18:00 UTC.
    let mut req = request(tid, t.id, tomorrow(), time(16, 30), 60);
    req.zone = "UTC".into();
    let err = f.engine.book(req).await.unwrap_err();
    assert_eq!(err.to_string(), "table busy 16:00–18:00");
}

#[tokio::test]
async fn canceled_reservation_no_longer_blocks() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;
    let r = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 120))
        .await
        .unwrap();
    f.engine
        .transition(tid, r.id, ReservationStatus::Canceled, "host")
        .await
        .unwrap();

    f.engine
        .book(request(tid, t.id, tomorrow(), time(19, 30), 60))
        .await
        .unwrap();

    // The canceled reservation is kept, not deleted.
    let window = Span::new(utc(2025, 6, 2, 0, 0), utc(2025, 6, 3, 0, 0));
    let all = f.engine.reservations_for_table(tid, t.id, window).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].status, ReservationStatus::Canceled);
}

#[tokio::test]
async fn quota_boundary_at_fifty() {
    let f = fixture();
    let tid = register(&f, PlanTier::Free, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;
    f.engine
        .quota()
        .increment_usage(tid, QuotaResource::Reservations, 49)
        .await
        .unwrap();

    f.engine
        .book(request(tid, t.id, tomorrow(), time(12, 0), 60))
        .await
        .unwrap();
    assert_eq!(month_reservations(&f, tid).await, 50);

    let err = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(14, 0), 60))
        .await
        .unwrap_err();
    match err {
        EngineError::QuotaExceeded(denial) => {
            assert_eq!(denial.resource, QuotaResource::Reservations);
            assert_eq!((denial.current_usage, denial.limit), (50, 50));
            assert_eq!(denial.reason, DenyReason::LimitReached);
            assert!(denial.upgrade_available);
        }
        other => panic!("expected quota denial, got {other:?}"),
    }
    assert_eq!(month_reservations(&f, tid).await, 50);
    let window = Span::new(utc(2025, 6, 2, 0, 0), utc(2025, 6, 3, 0, 0));
    assert_eq!(f.engine.reservations_for_table(tid, t.id, window).await.unwrap().len(), 1);
    assert!(f.audit.actions(tid).contains(&AuditAction::QuotaDenied));
}

#[tokio::test]
async fn monthly_quota_frees_up_next_month() {
    let f = fixture();
    let tid = register(&f, PlanTier::Free, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;
    f.engine
        .quota()
        .increment_usage(tid, QuotaResource::Reservations, 50)
        .await
        .unwrap();
    let july = date(2025, 7, 2);
    assert!(matches!(
        f.engine.book(request(tid, t.id, july, time(19, 0), 60)).await,
        Err(EngineError::QuotaExceeded(_))
    ));

    f.clock.set(utc(2025, 7, 1, 9, 0));
    f.engine
        .book(request(tid, t.id, july, time(19, 0), 60))
        .await
        .unwrap();
    let usage = f.store.usage(tid).await.unwrap().unwrap();
    assert_eq!(usage.period, 202507);
    assert_eq!(usage.month_reservations, 1);
    assert_eq!(usage.total_reservations, 51);
}

#[tokio::test]
async fn suspended_tenant_cannot_book() {
    let f = fixture();
    let tid = register(&f, PlanTier::Pro, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;
    f.engine.quota().suspend(tid, "chargeback", "billing").await.unwrap();

    let err = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 60))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::QuotaExceeded(ref d) if d.reason == DenyReason::Suspended && d.current_usage == 0
    ));
}

#[tokio::test]
async fn booking_validation_errors() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;

    let mut req = request(tid, t.id, tomorrow(), time(19, 0), 60);
    req.party_size = 0;
    assert!(matches!(
        f.engine.book(req).await,
        Err(EngineError::Validation(ValidationError::PartySize { got: 0, .. }))
    ));

    let mut req = request(tid, t.id, tomorrow(), time(19, 0), 60);
    req.party_size = 6;
    assert!(matches!(
        f.engine.book(req).await,
        Err(EngineError::Validation(ValidationError::Capacity { party_size: 6, min: 2, max: 4 }))
    ));

    let req = request(tid, t.id, tomorrow(), time(19, 0), 0);
    assert!(matches!(
        f.engine.book(req).await,
        Err(EngineError::Validation(ValidationError::Duration { got: 0, .. }))
    ));

    let req = request(tid, t.id, tomorrow(), time(19, 0), MAX_DURATION_MINUTES + 1);
    assert!(matches!(
        f.engine.book(req).await,
        Err(EngineError::Validation(ValidationError::Duration { .. }))
    ));

    let mut req = request(tid, t.id, tomorrow(), time(19, 0), 60);
    req.zone = "Europe/Atlantis".into();
    assert!(matches!(
        f.engine.book(req).await,
        Err(EngineError::Validation(ValidationError::Timezone(_)))
    ));

    let req = request(tid, t.id, date(1999, 12, 31), time(19, 0), 60);
    assert!(matches!(
        f.engine.book(req).await,
        Err(EngineError::Validation(ValidationError::OutOfRange))
    ));

    // Nothing was counted for rejected requests.
    assert_eq!(month_reservations(&f, tid).await, 0);
}

#[tokio::test]
async fn duration_defaults_follow_tenant_then_config() {
    let f = fixture();
    let mut record = tenant_record(PlanTier::Starter, None);
    record.default_duration_minutes = Some(90);
    let tid = record.id;
    f.engine.quota().register_tenant(record, "owner").await.unwrap();
    let t = table(&f, tid, "T1", 2, 4).await;

    let mut req = request(tid, t.id, tomorrow(), time(12, 0), 0);
    req.duration_minutes = None;
    assert_eq!(f.engine.book(req).await.unwrap().duration_minutes, 90);

    let other = register(&f, PlanTier::Starter, None).await;
    let t2 = table(&f, other, "T1", 2, 4).await;
    let mut req = request(other, t2.id, tomorrow(), time(12, 0), 0);
    req.duration_minutes = None;
    assert_eq!(f.engine.book(req).await.unwrap().duration_minutes, 120);
}

#[tokio::test]
async fn unknown_or_foreign_table_not_found() {
    let f = fixture();
    let a = register(&f, PlanTier::Starter, None).await;
    let b = register(&f, PlanTier::Starter, None).await;
    let table_of_b = table(&f, b, "T1", 2, 4).await;

    assert!(matches!(
        f.engine.book(request(a, Ulid::new(), tomorrow(), time(19, 0), 60)).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        f.engine.book(request(a, table_of_b.id, tomorrow(), time(19, 0), 60)).await,
        Err(EngineError::NotFound(id)) if id == table_of_b.id
    ));
    assert!(matches!(
        f.engine.book(request(Ulid::new(), table_of_b.id, tomorrow(), time(19, 0), 60)).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(month_reservations(&f, b).await, 0);
}

#[tokio::test]
async fn dst_gap_request_lands_after_gap() {
    let f = fixture();
    let mut record = tenant_record(PlanTier::Starter, None);
    record.timezone = "America/New_York".into();
    let tid = record.id;
    f.engine.quota().register_tenant(record, "owner").await.unwrap();
    let t = table(&f, tid, "T1", 2, 4).await;
    f.clock.set(utc(2024, 3, 1, 12, 0));

    let mut req = request(tid, t.id, date(2024, 3, 10), time(2, 30), 60);
    req.zone = "America/New_York".into();
    let r = f.engine.book(req).await.unwrap();
    assert_eq!(r.start, utc(2024, 3, 10, 7, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_winner_under_contention() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;

    let n = 24;
    let mut handles = Vec::new();
    for i in 0..n {
        let engine = f.engine.clone();
        // Every request overlaps every other one.
        let req = request(tid, t.id, tomorrow(), time(19, i % 30), 120);
        handles.push(tokio::spawn(async move { engine.book(req).await }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, n - 1);
    assert_eq!(month_reservations(&f, tid).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_slots_all_succeed_concurrently() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    let tables = [
        table(&f, tid, "T1", 2, 4).await,
        table(&f, tid, "T2", 2, 4).await,
    ];

    let mut handles = Vec::new();
    for t in &tables {
        for hour in 10..20 {
            let engine = f.engine.clone();
            let req = request(tid, t.id, tomorrow(), time(hour, 0), 60);
            handles.push(tokio::spawn(async move { engine.book(req).await }));
        }
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(month_reservations(&f, tid).await, 20);
}

// ── Retry policy ─────────────────────────────────────────

#[tokio::test]
async fn transient_failures_are_retried() {
    let (f, flaky, tid, t) = flaky_fixture(
        FlakyStore::new().failing(2, TransientError::SerializationFailure),
        test_config(),
    )
    .await;

    let r = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 60))
        .await
        .unwrap();
    assert_eq!(flaky.table_begins.load(Ordering::SeqCst), 3);
    assert_eq!(month_reservations(&f, tid).await, 1);
    let window = Span::new(r.start, r.end());
    assert_eq!(f.engine.reservations_for_table(tid, t.id, window).await.unwrap(), vec![r]);
}

#[tokio::test]
async fn retries_exhausted_after_bound() {
    let (f, flaky, tid, t) = flaky_fixture(
        FlakyStore::new().failing(10, TransientError::Deadlock),
        test_config(),
    )
    .await;

    let err = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 60))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RetryExhausted { attempts: 3, last: TransientError::Deadlock }
    ));
    assert_eq!(flaky.table_begins.load(Ordering::SeqCst), 3);
    assert_eq!(month_reservations(&f, tid).await, 0);
}

#[tokio::test]
async fn persistence_errors_are_not_retried() {
    let (f, flaky, tid, t) = flaky_fixture(FlakyStore::new().broken(), test_config()).await;

    let err = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 60))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Persistence(ref m) if m == "disk unavailable"));
    assert_eq!(flaky.table_begins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_attempt_times_out_and_retries() {
    let config = EngineConfig {
        attempt_timeout_ms: 20,
        ..test_config()
    };
    let (f, flaky, tid, t) = flaky_fixture(FlakyStore::new().stalling(1), config).await;

    f.engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 60))
        .await
        .unwrap();
    assert_eq!(flaky.table_begins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn held_table_lock_exhausts_retries_with_timeout() {
    let store = Arc::new(MemoryStore::new().with_lock_timeout(Duration::from_millis(10)));
    let config = EngineConfig {
        max_booking_attempts: 2,
        ..test_config()
    };
    let f = fixture_over(store.clone(), config);
    let tid = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;

    let held = store.begin(LockScope::Table(t.id)).await.unwrap();
    let err = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 60))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RetryExhausted { attempts: 2, last: TransientError::Timeout }
    ));
    held.rollback();

    f.engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 60))
        .await
        .unwrap();
}

// ── Lifecycle and table administration ───────────────────

#[tokio::test]
async fn lifecycle_follows_transition_graph() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;
    let r = f
        .engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 60))
        .await
        .unwrap();

    f.clock.advance(60_000);
    let path = [
        ReservationStatus::Confirmed,
        ReservationStatus::Seated,
        ReservationStatus::InProgress,
        ReservationStatus::Completed,
    ];
    for status in path {
        let updated = f.engine.transition(tid, r.id, status, "host").await.unwrap();
        assert_eq!(updated.status, status);
        assert_eq!(updated.updated_at, start_of_test() + 60_000);
    }

    let err = f
        .engine
        .transition(tid, r.id, ReservationStatus::Seated, "host")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: ReservationStatus::Completed,
            to: ReservationStatus::Seated
        }
    ));
    f.engine
        .transition(tid, r.id, ReservationStatus::Archived, "system")
        .await
        .unwrap();

    let changes = f
        .audit
        .entries(tid)
        .into_iter()
        .filter(|e| e.action == AuditAction::ReservationStatusChanged)
        .count();
    assert_eq!(changes, 5);

    assert!(matches!(
        f.engine.transition(tid, Ulid::new(), ReservationStatus::Canceled, "host").await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        f.engine.transition(tid, r.id, ReservationStatus::Archived, "").await,
        Err(EngineError::Validation(ValidationError::Empty("performed_by")))
    ));
}

#[tokio::test]
async fn table_creation_counts_against_plan() {
    let f = fixture();
    let tid = register(&f, PlanTier::Free, None).await;
    for i in 0..5 {
        table(&f, tid, &format!("T{i}"), 1, 4).await;
    }
    let err = f
        .engine
        .create_table(tid, "T6", 1, 4, "owner")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::QuotaExceeded(ref d) if d.resource == QuotaResource::Tables && d.limit == 5
    ));
    assert_eq!(f.store.tables_for_tenant(tid).await.unwrap().len(), 5);
    assert_eq!(f.store.usage(tid).await.unwrap().unwrap().tables, 5);

    f.engine.quota().change_plan(tid, PlanTier::Starter, "owner").await.unwrap();
    table(&f, tid, "T6", 1, 4).await;
}

#[tokio::test]
async fn table_creation_validation() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    assert!(matches!(
        f.engine.create_table(tid, "", 1, 4, "owner").await,
        Err(EngineError::Validation(ValidationError::Empty(_)))
    ));
    assert!(matches!(
        f.engine.create_table(tid, "T1", 5, 4, "owner").await,
        Err(EngineError::Validation(ValidationError::CapacityRange { min: 5, max: 4 }))
    ));
    assert!(matches!(
        f.engine.create_table(tid, "T1", 0, 4, "owner").await,
        Err(EngineError::Validation(ValidationError::CapacityRange { .. }))
    ));
    assert!(matches!(
        f.engine.create_table(Ulid::new(), "T1", 1, 4, "owner").await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Status and availability ──────────────────────────────

#[tokio::test]
async fn table_statuses_follow_the_clock() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    let now_table = table(&f, tid, "Now", 2, 4).await;
    let soon = table(&f, tid, "Soon", 2, 4).await;
    let later = table(&f, tid, "Later", 2, 4).await;
    let closed = table(&f, tid, "Closed", 2, 4).await;

    // Local time is 12:00.
    for (t, at) in [(&now_table, time(12, 0)), (&soon, time(13, 30)), (&later, time(15, 0))] {
        f.engine.book(request(tid, t.id, today(), at, 60)).await.unwrap();
    }
    f.engine.set_table_unavailable(tid, closed.id, true, "manager").await.unwrap();

    fn status_of(views: &[TableStatusView], id: TableId) -> TableStatus {
        views.iter().find(|v| v.table_id == id).unwrap().status
    }

    let views = f.engine.table_statuses(tid).await.unwrap();
    assert_eq!(views.len(), 4);
    assert!(views.windows(2).all(|w| w[0].table_id < w[1].table_id));
    assert_eq!(status_of(&views, now_table.id), TableStatus::Occupied);
    assert_eq!(status_of(&views, soon.id), TableStatus::Reserved);
    assert_eq!(status_of(&views, later.id), TableStatus::Free);
    assert_eq!(status_of(&views, closed.id), TableStatus::Unavailable);
    assert_eq!(f.engine.table_statuses(tid).await.unwrap(), views);

    // 13:30 local.
    f.clock.advance(90 * MINUTE_MS);
    let views = f.engine.table_statuses(tid).await.unwrap();
    assert_eq!(status_of(&views, now_table.id), TableStatus::Free);
    assert_eq!(status_of(&views, soon.id), TableStatus::Occupied);
    assert_eq!(status_of(&views, later.id), TableStatus::Reserved);

    f.engine.set_table_unavailable(tid, closed.id, false, "manager").await.unwrap();
    let views = f.engine.table_statuses(tid).await.unwrap();
    assert_eq!(status_of(&views, closed.id), TableStatus::Free);
    assert_eq!(
        f.audit
            .actions(tid)
            .iter()
            .filter(|a| **a == AuditAction::TableAvailabilityChanged)
            .count(),
        2
    );
}

fn noon_to_four() -> Option<(NaiveTime, NaiveTime)> {
    Some((time(12, 0), time(16, 0)))
}

fn query(tenant_id: TenantId, day: NaiveDate, preferred: Option<NaiveTime>, max: usize) -> AvailabilityQuery {
    AvailabilityQuery {
        tenant_id,
        date: day,
        party_size: 2,
        preferred_time: preferred,
        max_results: max,
        duration_minutes: Some(120),
    }
}

#[tokio::test]
async fn alternatives_ranked_by_distance() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, noon_to_four()).await;
    let busy = table(&f, tid, "Busy", 2, 4).await;
    let open = table(&f, tid, "Open", 2, 4).await;
    table(&f, tid, "Large", 6, 8).await;
    f.engine
        .book(request(tid, busy.id, tomorrow(), time(13, 0), 120))
        .await
        .unwrap();

    let slots = f
        .engine
        .find_alternatives(query(tid, tomorrow(), Some(time(13, 0)), 3))
        .await
        .unwrap();
    let got: Vec<(NaiveTime, TableId)> = slots.iter().map(|s| (s.time, s.table_id)).collect();
    assert_eq!(
        got,
        vec![
            (time(13, 0), open.id),
            (time(12, 30), open.id),
            (time(13, 30), open.id),
        ]
    );
    assert_eq!(slots[0].table_name, "Open");
    assert_eq!(slots[0].date, tomorrow());
    assert_eq!((slots[0].min_capacity, slots[0].max_capacity), (2, 4));
}

#[tokio::test]
async fn alternatives_chronological_without_preference() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, noon_to_four()).await;
    let a = table(&f, tid, "A", 2, 4).await;
    let b = table(&f, tid, "B", 2, 4).await;
    let (first, second) = if a.id < b.id { (a.id, b.id) } else { (b.id, a.id) };

    let slots = f
        .engine
        .find_alternatives(query(tid, tomorrow(), None, 50))
        .await
        .unwrap();
    // Grid 12:00..14:00 every 30 minutes, two tables.
    assert_eq!(slots.len(), 10);
    assert_eq!((slots[0].time, slots[0].table_id), (time(12, 0), first));
    assert_eq!((slots[1].time, slots[1].table_id), (time(12, 0), second));
    assert!(slots.windows(2).all(|w| w[0].starts_at <= w[1].starts_at));
    assert_eq!(slots.last().unwrap().time, time(14, 0));
}

#[tokio::test]
async fn alternatives_skip_past_slots() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, Some((time(10, 0), time(16, 0)))).await;
    table(&f, tid, "T1", 2, 4).await;

    // Local time is 12:00; 12:00 itself is not offered.
    let slots = f
        .engine
        .find_alternatives(query(tid, today(), None, 50))
        .await
        .unwrap();
    let times: Vec<NaiveTime> = slots.iter().map(|s| s.time).collect();
    assert_eq!(times, vec![time(12, 30), time(13, 0), time(13, 30), time(14, 0)]);
    assert!(slots.iter().all(|s| s.starts_at > start_of_test()));
}

#[tokio::test]
async fn alternatives_cross_midnight() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, Some((time(20, 0), time(2, 0)))).await;
    table(&f, tid, "Bar", 2, 4).await;

    let slots = f
        .engine
        .find_alternatives(query(tid, tomorrow(), None, 50))
        .await
        .unwrap();
    let last = slots.last().unwrap();
    assert_eq!((last.date, last.time), (date(2025, 6, 3), time(0, 0)));
    assert_eq!(slots.first().unwrap().time, time(20, 0));
    assert_eq!(slots.len(), 9);
}

#[tokio::test]
async fn alternatives_standard_grid_without_hours() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    table(&f, tid, "T1", 2, 4).await;

    let slots = f
        .engine
        .find_alternatives(query(tid, tomorrow(), None, 50))
        .await
        .unwrap();
    let times: Vec<NaiveTime> = slots.iter().map(|s| s.time).collect();
    assert_eq!(times.len(), 12);
    assert_eq!(times[0], time(12, 0));
    assert_eq!(times[4], time(14, 0));
    assert_eq!(times[5], time(18, 0));
    assert_eq!(times[11], time(21, 0));
}

#[tokio::test]
async fn fully_booked_returns_empty() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, noon_to_four()).await;
    let t = table(&f, tid, "Only", 2, 4).await;
    f.engine
        .book(request(tid, t.id, tomorrow(), time(12, 0), 240))
        .await
        .unwrap();

    let slots = f
        .engine
        .find_alternatives(query(tid, tomorrow(), Some(time(13, 0)), 5))
        .await
        .unwrap();
    assert!(slots.is_empty());

    let mut big_party = query(tid, tomorrow(), None, 5);
    big_party.party_size = 10;
    assert!(f.engine.find_alternatives(big_party).await.unwrap().is_empty());
}

#[tokio::test]
async fn alternatives_validation() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    assert!(matches!(
        f.engine.find_alternatives(query(tid, tomorrow(), None, 0)).await,
        Err(EngineError::Validation(ValidationError::MaxResults(_)))
    ));
    assert!(matches!(
        f.engine
            .find_alternatives(query(tid, tomorrow(), None, MAX_ALTERNATIVES + 1))
            .await,
        Err(EngineError::Validation(ValidationError::MaxResults(_)))
    ));
    assert!(matches!(
        f.engine.find_alternatives(query(Ulid::new(), tomorrow(), None, 5)).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn unavailable_tables_are_not_suggested() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, noon_to_four()).await;
    let t = table(&f, tid, "T1", 2, 4).await;
    f.engine.set_table_unavailable(tid, t.id, true, "manager").await.unwrap();
    let slots = f
        .engine
        .find_alternatives(query(tid, tomorrow(), None, 5))
        .await
        .unwrap();
    assert!(slots.is_empty());
}

#[tokio::test]
async fn reservations_for_table_scoped_to_tenant() {
    let f = fixture();
    let a = register(&f, PlanTier::Starter, None).await;
    let b = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, a, "T1", 2, 4).await;
    let window = Span::new(0, MAX_VALID_TIMESTAMP_MS);
    assert!(f.engine.reservations_for_table(a, t.id, window).await.unwrap().is_empty());
    assert!(matches!(
        f.engine.reservations_for_table(b, t.id, window).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn reservations_for_table_accepts_unbounded_window() {
    let f = fixture();
    let tid = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, tid, "T1", 2, 4).await;
    f.engine
        .book(request(tid, t.id, tomorrow(), time(19, 0), 120))
        .await
        .unwrap();
    let all = f
        .engine
        .reservations_for_table(tid, t.id, Span::new(Ms::MIN, Ms::MAX))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn lifecycle_changes_are_scoped_to_tenant() {
    let f = fixture();
    let owner = register(&f, PlanTier::Starter, None).await;
    let other = register(&f, PlanTier::Starter, None).await;
    let t = table(&f, owner, "T1", 2, 4).await;
    let r = f
        .engine
        .book(request(owner, t.id, tomorrow(), time(19, 0), 60))
        .await
        .unwrap();

    assert!(matches!(
        f.engine.transition(other, r.id, ReservationStatus::Canceled, "host").await,
        Err(EngineError::NotFound(id)) if id == r.id
    ));
    assert!(matches!(
        f.engine.set_table_unavailable(other, t.id, true, "manager").await,
        Err(EngineError::NotFound(id)) if id == t.id
    ));

    let window = Span::new(0, MAX_VALID_TIMESTAMP_MS);
    let stored = f.engine.reservations_for_table(owner, t.id, window).await.unwrap();
    assert_eq!(stored[0].status, ReservationStatus::Created);
    assert!(!f.store.table(t.id).await.unwrap().unwrap().unavailable);
    assert!(!f.audit.actions(owner).iter().any(|a| matches!(
        a,
        AuditAction::ReservationStatusChanged | AuditAction::TableAvailabilityChanged
    )));
}
