use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Build the appointment span `[start, end)`, defaulting `end` to
/// `start + duration_min`. Ranges that are empty, inverted or run past
/// midnight are rejected before the conflict check ever runs.
pub(crate) fn appointment_span(
    start: TimeOfDay,
    end: Option<TimeOfDay>,
    duration_min: u32,
) -> Result<Span, EngineError> {
    let end = match end {
        Some(end) => end,
        None => start.checked_add_minutes(duration_min).ok_or_else(|| {
            EngineError::InvalidRange(format!(
                "{start} + {duration_min} min runs past the end of the day"
            ))
        })?,
    };
    Span::checked(start, end)
        .ok_or_else(|| EngineError::InvalidRange(format!("start {start} must be before end {end}")))
}

pub(crate) fn validate_weekly(day_of_week: u8, start: TimeOfDay, end: TimeOfDay) -> Result<(), EngineError> {
    if day_of_week > 6 {
        return Err(EngineError::InvalidRange(format!(
            "day_of_week {day_of_week} out of range 0..=6"
        )));
    }
    if start >= end {
        return Err(EngineError::InvalidRange(format!(
            "opening time {start} must be before closing time {end}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_duration(duration_min: u32) -> Result<(), EngineError> {
    if duration_min == 0 || duration_min > MAX_SERVICE_DURATION_MIN {
        return Err(EngineError::InvalidRange(format!(
            "service duration {duration_min} min out of range 1..={MAX_SERVICE_DURATION_MIN}"
        )));
    }
    Ok(())
}

/// The booking conflict guard.
///
/// Fails with `SlotUnavailable` if `span` overlaps any pending or confirmed
/// appointment on the day, other than `ignore` (the appointment being moved).
/// Callers must hold the day's write lock across this check and the insert.
pub(crate) fn check_no_conflict(
    day: &DaySchedule,
    span: &Span,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    for existing in day.overlapping(span) {
        if Some(existing.id) == ignore || !existing.status.is_occupying() {
            continue;
        }
        if existing.span.overlaps(span) {
            metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotUnavailable(existing.id));
        }
    }
    Ok(())
}
