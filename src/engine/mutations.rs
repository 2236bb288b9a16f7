use std::time::Instant;

use ulid::Ulid;

use crate::model::*;

use super::conflict::{apply_patch, check_slot_free};
use super::{record_outcome, Engine, EngineError};

impl Engine {
    /// Reserve `[start, end)` on a resource. The new reservation is always
    /// active. Nothing is stored unless the whole call succeeds.
    pub async fn create(&self, request: ReservationRequest) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.create_locked(request).await;
        record_outcome("create", started, &result);
        result
    }

    /// Change the interval and/or status of a reservation. Only the fields
    /// set in `patch` change; a new interval must not overlap any other
    /// active reservation of the same resource.
    pub async fn update(&self, id: Ulid, patch: ReservationPatch) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.update_locked(id, patch).await;
        record_outcome("update", started, &result);
        result
    }

    /// Cancel an active reservation. Cancelling twice fails with
    /// `AlreadyCancelled` and leaves the record untouched.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.cancel_locked(id).await;
        record_outcome("cancel", started, &result);
        result
    }

    async fn create_locked(&self, request: ReservationRequest) -> Result<Reservation, EngineError> {
        let span = Span::validate(request.start, request.end)?;
        let resource_id = request.resource_id;

        let _lock = self.lock_resource(resource_id).await?;
        let occupants = self
            .read("list_active_overlapping", || {
                self.store.list_active_overlapping(resource_id, span, None)
            })
            .await?;
        if let Err(e) = check_slot_free(&occupants) {
            tracing::debug!("create on {resource_id} {span} rejected: {e}");
            return Err(e);
        }

        let reservation = self
            .write(
                "insert",
                self.store.insert(NewReservation {
                    resource_id,
                    holder_id: request.holder_id,
                    span,
                }),
            )
            .await?;
        tracing::info!(
            "reservation {} created on {resource_id} {span} for {}",
            reservation.id,
            reservation.holder_id
        );
        Ok(reservation)
    }

    async fn update_locked(&self, id: Ulid, patch: ReservationPatch) -> Result<Reservation, EngineError> {
        let found = self.fetch(id).await?;
        let _lock = self.lock_resource(found.resource_id).await?;
        // Another writer may have moved or cancelled it before we got the lock.
        let current = self.fetch(id).await?;

        let Some(next) = apply_patch(&current, &patch)? else {
            return Ok(current);
        };
        if patch.touches_span() && next.is_active() {
            let occupants = self
                .read("list_active_overlapping", || {
                    self.store
                        .list_active_overlapping(next.resource_id, next.span, Some(id))
                })
                .await?;
            if let Err(e) = check_slot_free(&occupants) {
                tracing::debug!("update of {id} to {} rejected: {e}", next.span);
                return Err(e);
            }
        }

        let updated = self.write("update", self.store.update(next)).await?;
        tracing::info!(
            "reservation {id} updated: {} -> {}, {} -> {}",
            current.span,
            updated.span,
            current.status,
            updated.status
        );
        Ok(updated)
    }

    async fn cancel_locked(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let found = self.fetch(id).await?;
        if !found.is_active() {
            return Err(EngineError::AlreadyCancelled(id));
        }
        let _lock = self.lock_resource(found.resource_id).await?;
        let mut next = self.fetch(id).await?;
        if !next.is_active() {
            return Err(EngineError::AlreadyCancelled(id));
        }
        next.status = ReservationStatus::Cancelled;

        let cancelled = self.write("update", self.store.update(next)).await?;
        tracing::info!("reservation {id} cancelled on {}", cancelled.resource_id);
        Ok(cancelled)
    }

    async fn fetch(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.read("get_by_id", || self.store.get_by_id(id))
            .await?
            .ok_or(EngineError::NotFound(id))
    }
}
