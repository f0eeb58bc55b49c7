use crate::limits::RESERVED_LOOKAHEAD_MS;
use crate::model::*;

/// Live status of a table at `now`. A read-side projection: recompute it whenever
/// reservations change or time moves, never feed it back into conflict checks.
///
/// Priority: admin override, then occupied, then reserved within the look-ahead
/// window, then free.
pub fn derive_status(table: &Table, now: Ms, reservations: &[Reservation]) -> TableStatus {
    if table.unavailable {
        return TableStatus::Unavailable;
    }

    let active = || {
        reservations
            .iter()
            .filter(move |r| r.table_id == table.id && r.is_active())
    };

    if active().any(|r| r.span().contains_instant(now)) {
        return TableStatus::Occupied;
    }

    let horizon = now + RESERVED_LOOKAHEAD_MS;
    if active().any(|r| r.start >= now && r.start < horizon) {
        return TableStatus::Reserved;
    }

    TableStatus::Free
}
