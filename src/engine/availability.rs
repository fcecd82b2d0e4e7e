use chrono::NaiveDate;

use crate::model::*;

// ── Slot resolution ────────────────────────────────────────────────

/// Candidate start times are always laid on a 30-minute grid anchored at the
/// day's opening time, whatever the service duration.
pub const SLOT_STEP_MIN: u32 = 30;

/// The active weekly row governing `date`, if any. When several active rows
/// exist for one weekday the oldest (lowest ULID) wins.
pub fn weekly_row_for(date: NaiveDate, weekly: &[WeeklyAvailability]) -> Option<&WeeklyAvailability> {
    let dow = day_of_week(date);
    weekly
        .iter()
        .filter(|row| row.active && row.day_of_week == dow)
        .min_by_key(|row| row.id)
}

/// Bookable start times for a service of `duration_min` minutes on `date`.
///
/// Blocked dates dominate: a date present in `blocked` has no slots at all.
/// Otherwise every step `t` from the weekly row's start is offered when
/// `t + duration <= end`. Occupancy is not considered here; the conflict
/// check at booking time is what enforces it.
pub fn resolve_slots(
    date: NaiveDate,
    duration_min: u32,
    weekly: &[WeeklyAvailability],
    blocked: &[BlockedDate],
) -> Vec<TimeOfDay> {
    if blocked.iter().any(|b| b.date == date) {
        return Vec::new();
    }
    let Some(row) = weekly_row_for(date, weekly) else {
        return Vec::new();
    };

    let open = row.start.minutes();
    let close = row.end.minutes();
    let mut slots = Vec::new();
    let mut t = open;
    while t < close {
        if t + duration_min <= close
            && let Some(slot) = TimeOfDay::from_minutes(t)
        {
            slots.push(slot);
        }
        t += SLOT_STEP_MIN;
    }
    slots
}
