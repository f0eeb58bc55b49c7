use chrono::{NaiveTime, Timelike};

use crate::model::*;

// ── Slot grid ─────────────────────────────────────────────────────

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Standard service windows used when a tenant has no operating hours:
/// lunch starts 12:00–14:00, dinner starts 18:00–21:00 (inclusive bounds).
const STANDARD_WINDOWS: [(u32, u32); 2] = [(12 * 60, 14 * 60), (18 * 60, 21 * 60)];

fn minutes_of(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

/// Slot start offsets, in minutes after local midnight of the requested date.
///
/// With operating hours, every `step` from open while the slot still finishes by
/// close; a close at or before open continues past midnight (offsets ≥ 1440).
pub fn slot_grid(hours: Option<&OperatingHours>, step: u32, duration: u32) -> Vec<u32> {
    let step = step.max(1);
    match hours {
        Some(h) => {
            let open = minutes_of(h.open);
            let mut close = minutes_of(h.close);
            if close <= open {
                close += MINUTES_PER_DAY;
            }
            (open..close)
                .step_by(step as usize)
                .take_while(|s| s + duration <= close)
                .collect()
        }
        None => STANDARD_WINDOWS
            .iter()
            .flat_map(|&(first, last)| (first..=last).step_by(step as usize))
            .collect(),
    }
}

// ── Ranking ──────────────────────────────────────────────────────

/// Order candidates by distance from `preferred` (ties: table id, then time), or
/// chronologically (ties: table id) without a preference, then truncate.
pub fn rank_candidates(
    mut candidates: Vec<SlotSuggestion>,
    preferred: Option<Ms>,
    max_results: usize,
) -> Vec<SlotSuggestion> {
    match preferred {
        Some(p) => candidates
            .sort_by_key(|c| ((c.starts_at - p).unsigned_abs(), c.table_id, c.starts_at)),
        None => candidates.sort_by_key(|c| (c.starts_at, c.table_id)),
    }
    candidates.truncate(max_results);
    candidates
}
