use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Build a span from raw bounds, rejecting inverted ranges and out-of-range timestamps.
pub(crate) fn validate_range(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::checked(start, end)
        .ok_or_else(|| EngineError::validation(format!("range [{start}, {end}) is empty or inverted")))?;
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn reject_past_start(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start < now {
        return Err(EngineError::validation(format!(
            "start {} is in the past (now {now})",
            span.start
        )));
    }
    Ok(())
}

/// Blocking reservations on `rs` overlapping `span`, ignoring `exclude` (the row being updated).
pub(crate) fn blockers(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Vec<Ulid> {
    rs.blocking(span)
        .filter(|r| Some(r.id) != exclude)
        .map(|r| r.id)
        .collect()
}

/// Caller must hold the resource's write lock so the check and the commit are one step.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let conflicting = blockers(rs, span, exclude);
    if conflicting.is_empty() {
        Ok(())
    } else {
        metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
        Err(EngineError::Conflict {
            resource_id: rs.id,
            conflicting,
        })
    }
}
