use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// A table counts as "reserved" when an active reservation starts within this
/// window after now. Half-open: `[now, now + RESERVED_LOOKAHEAD_MS)`.
pub const RESERVED_LOOKAHEAD_MS: Ms = 2 * HOUR_MS;

pub const MAX_DURATION_MINUTES: u32 = 12 * 60;
pub const MAX_PARTY_SIZE: u32 = 100;
pub const MAX_TABLE_NAME_LEN: usize = 64;
pub const MAX_PERFORMED_BY_LEN: usize = 128;
pub const MAX_ALTERNATIVES: usize = 50;

/// Bounds for any instant accepted by the store (2000-01-01 .. 2100-01-01 UTC).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// How far back a table scan reaches when looking for reservations that could
/// still overlap a window. Nothing lasts longer than `MAX_DURATION_MINUTES`.
pub const MAX_RESERVATION_SPAN_MS: Ms = MAX_DURATION_MINUTES as Ms * MINUTE_MS;

/// Longest DST gap we walk across when resolving a nonexistent local time.
pub const MAX_DST_GAP_MINUTES: i64 = 3 * 60;
