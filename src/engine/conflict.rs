use crate::model::*;

/// First active reservation on `table_id` whose span overlaps `[start, end)`.
/// All comparisons are on UTC instants; inactive reservations never block.
pub fn find_conflict<'a>(
    table_id: TableId,
    start: Ms,
    end: Ms,
    existing: &'a [Reservation],
) -> Option<&'a Reservation> {
    if start >= end {
        return None;
    }
    let proposed = Span::new(start, end);
    existing
        .iter()
        .filter(|r| r.table_id == table_id && r.is_active())
        .filter(|r| r.span().overlaps(&proposed))
        .min_by_key(|r| (r.start, r.id))
}

pub fn has_conflict(table_id: TableId, start: Ms, end: Ms, existing: &[Reservation]) -> bool {
    find_conflict(table_id, start, end, existing).is_some()
}
