use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MINUTE_MS;

/// Unix milliseconds in UTC. Produced from wall-clock input only by `tz::TimeZoneConverter`.
pub type Ms = i64;

pub type TenantId = Ulid;
pub type TableId = Ulid;
pub type ReservationId = Ulid;
pub type GuestId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + minutes as Ms * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Created,
    Confirmed,
    Seated,
    InProgress,
    Completed,
    Canceled,
    NoShow,
    Archived,
}

impl ReservationStatus {
    /// Active reservations occupy their table and take part in conflict checks.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ReservationStatus::Created
                | ReservationStatus::Confirmed
                | ReservationStatus::Seated
                | ReservationStatus::InProgress
        )
    }

    pub fn can_transition_to(self, to: ReservationStatus) -> bool {
        use ReservationStatus::*;
        match self {
            Created => matches!(to, Confirmed | Seated | Canceled | NoShow),
            Confirmed => matches!(to, Seated | Canceled | NoShow),
            Seated => matches!(to, InProgress | Completed | Canceled),
            InProgress => matches!(to, Completed),
            Completed | Canceled | NoShow => matches!(to, Archived),
            Archived => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Created => "created",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Seated => "seated",
            ReservationStatus::InProgress => "in_progress",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Canceled => "canceled",
            ReservationStatus::NoShow => "no_show",
            ReservationStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    pub table_id: TableId,
    pub guest_id: GuestId,
    pub start: Ms,
    pub duration_minutes: u32,
    pub party_size: u32,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn end(&self) -> Ms {
        self.start + self.duration_minutes as Ms * MINUTE_MS
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

// ── Tables ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub tenant_id: TenantId,
    pub name: String,
    pub min_capacity: u32,
    pub max_capacity: u32,
    /// Administrative override. Never derived from reservations.
    pub unavailable: bool,
}

impl Table {
    pub fn fits(&self, party_size: u32) -> bool {
        self.min_capacity <= party_size && party_size <= self.max_capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Free,
    Occupied,
    Reserved,
    Unavailable,
}

impl TableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TableStatus::Free => "free",
            TableStatus::Occupied => "occupied",
            TableStatus::Reserved => "reserved",
            TableStatus::Unavailable => "unavailable",
        }
    }
}

// ── Tenants, plans, usage ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub open: NaiveTime,
    /// A close time at or before `open` means service runs past midnight.
    pub close: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Trial,
    Active,
    Suspended,
    Inactive,
}

impl AccountStatus {
    pub fn is_operational(self) -> bool {
        matches!(self, AccountStatus::Trial | AccountStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Trial => "trial",
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    OnlineBooking,
    ChatBot,
    AiAssistant,
    Analytics,
    CustomBranding,
    ApiAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    Tables,
    Reservations,
    Staff,
    Storage,
}

impl QuotaResource {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaResource::Tables => "tables",
            QuotaResource::Reservations => "reservations",
            QuotaResource::Staff => "staff",
            QuotaResource::Storage => "storage",
        }
    }
}

/// Plan ceilings. Immutable reference data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_tables: u64,
    pub max_monthly_reservations: u64,
    pub max_staff: u64,
    pub max_storage_bytes: u64,
}

impl PlanLimits {
    pub fn ceiling(&self, resource: QuotaResource) -> u64 {
        match resource {
            QuotaResource::Tables => self.max_tables,
            QuotaResource::Reservations => self.max_monthly_reservations,
            QuotaResource::Staff => self.max_staff,
            QuotaResource::Storage => self.max_storage_bytes,
        }
    }
}

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Free,
        PlanTier::Starter,
        PlanTier::Pro,
        PlanTier::Enterprise,
    ];

    pub fn limits(self) -> PlanLimits {
        match self {
            PlanTier::Free => PlanLimits {
                max_tables: 5,
                max_monthly_reservations: 50,
                max_staff: 2,
                max_storage_bytes: 50 * MB,
            },
            PlanTier::Starter => PlanLimits {
                max_tables: 20,
                max_monthly_reservations: 500,
                max_staff: 10,
                max_storage_bytes: 500 * MB,
            },
            PlanTier::Pro => PlanLimits {
                max_tables: 100,
                max_monthly_reservations: 5_000,
                max_staff: 50,
                max_storage_bytes: 5_000 * MB,
            },
            PlanTier::Enterprise => PlanLimits {
                max_tables: 1_000,
                max_monthly_reservations: 100_000,
                max_staff: 1_000,
                max_storage_bytes: 100_000 * MB,
            },
        }
    }

    pub fn default_features(self) -> &'static [Feature] {
        match self {
            PlanTier::Free => &[Feature::OnlineBooking],
            PlanTier::Starter => &[Feature::OnlineBooking, Feature::ChatBot],
            PlanTier::Pro => &[
                Feature::OnlineBooking,
                Feature::ChatBot,
                Feature::AiAssistant,
                Feature::Analytics,
            ],
            PlanTier::Enterprise => &[
                Feature::OnlineBooking,
                Feature::ChatBot,
                Feature::AiAssistant,
                Feature::Analytics,
                Feature::CustomBranding,
                Feature::ApiAccess,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub name: String,
    /// IANA zone identifier, validated on registration.
    pub timezone: String,
    pub plan: PlanTier,
    pub status: AccountStatus,
    pub feature_overrides: BTreeMap<Feature, bool>,
    pub operating_hours: Option<OperatingHours>,
    pub default_duration_minutes: Option<u32>,
}

/// Usage period as `yyyymm` in the tenant's zone.
pub type Period = u32;

pub fn period_of(date: NaiveDate) -> Period {
    use chrono::Datelike;
    date.year() as u32 * 100 + date.month()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUsage {
    pub tenant_id: TenantId,
    pub period: Period,
    pub tables: u64,
    pub month_reservations: u64,
    pub staff: u64,
    pub storage_bytes: u64,
    /// Lifetime counter, never reset.
    pub total_reservations: u64,
}

impl TenantUsage {
    pub fn new(tenant_id: TenantId, period: Period) -> Self {
        Self {
            tenant_id,
            period,
            tables: 0,
            month_reservations: 0,
            staff: 0,
            storage_bytes: 0,
            total_reservations: 0,
        }
    }

    /// View of the counters as seen from `period`. Monthly counters read as zero
    /// once the stored period is behind.
    pub fn as_of(&self, period: Period) -> TenantUsage {
        let mut view = self.clone();
        if period > self.period {
            view.period = period;
            view.month_reservations = 0;
        }
        view
    }

    pub fn current(&self, resource: QuotaResource) -> u64 {
        match resource {
            QuotaResource::Tables => self.tables,
            QuotaResource::Reservations => self.month_reservations,
            QuotaResource::Staff => self.staff,
            QuotaResource::Storage => self.storage_bytes,
        }
    }

    pub fn apply(&mut self, resource: QuotaResource, amount: u64, period: Period) {
        *self = self.as_of(period);
        match resource {
            QuotaResource::Tables => self.tables = self.tables.saturating_add(amount),
            QuotaResource::Reservations => {
                self.month_reservations = self.month_reservations.saturating_add(amount);
                self.total_reservations = self.total_reservations.saturating_add(amount);
            }
            QuotaResource::Staff => self.staff = self.staff.saturating_add(amount),
            QuotaResource::Storage => {
                self.storage_bytes = self.storage_bytes.saturating_add(amount)
            }
        }
    }
}

/// Flat event records; this is the WAL format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TenantSaved {
        tenant: TenantRecord,
    },
    TableSaved {
        table: Table,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: ReservationId,
        table_id: TableId,
        status: ReservationStatus,
        at: Ms,
    },
    UsageRecorded {
        tenant_id: TenantId,
        resource: QuotaResource,
        amount: u64,
        period: Period,
    },
    /// Full counter state; written on tenant registration and by compaction.
    UsageRestored {
        usage: TenantUsage,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatusView {
    pub table_id: TableId,
    pub name: String,
    pub status: TableStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSuggestion {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub starts_at: Ms,
    pub table_id: TableId,
    pub table_name: String,
    pub min_capacity: u32,
    pub max_capacity: u32,
}
