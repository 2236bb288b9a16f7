use crate::model::*;

use super::EngineError;

/// Fail with the first occupant if the slot is taken.
pub(super) fn check_slot_free(occupants: &[Reservation]) -> Result<(), EngineError> {
    match occupants.first() {
        Some(existing) => Err(EngineError::SlotUnavailable(existing.id)),
        None => Ok(()),
    }
}

/// Merge a partial update into `current`.
///
/// Cancelled is terminal, so any patch against a cancelled reservation fails.
/// Returns `None` when the patch changes nothing.
pub(super) fn apply_patch(
    current: &Reservation,
    patch: &ReservationPatch,
) -> Result<Option<Reservation>, EngineError> {
    if !current.is_active() {
        return Err(EngineError::AlreadyCancelled(current.id));
    }
    let mut next = current.clone();
    if patch.touches_span() {
        next.span = Span::validate(
            Some(patch.start.unwrap_or(current.span.start)),
            Some(patch.end.unwrap_or(current.span.end)),
        )?;
    }
    if let Some(status) = patch.status {
        next.status = status;
    }
    if same_span(&next.span, &current.span) && next.status == current.status {
        return Ok(None);
    }
    Ok(Some(next))
}

/// Equal instants and equal offsets. `Span`'s own `==` ignores the offset.
fn same_span(a: &Span, b: &Span) -> bool {
    a == b && a.start.offset() == b.start.offset() && a.end.offset() == b.end.offset()
}
