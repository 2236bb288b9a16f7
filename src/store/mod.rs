//! Durable reservation storage.
//!
//! The store persists records and answers range lookups. Its only rule is the
//! exclusion constraint: an insert or update that would make two active
//! reservations of one resource overlap fails with [`StoreError::Conflict`].

mod wal_store;
mod writer;

pub use wal_store::WalStore;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate};
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend temporarily unreachable or overloaded.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("WAL error: {0}")]
    Wal(String),
    /// Exclusion constraint: the write would overlap this active reservation.
    #[error("overlaps active reservation {0}")]
    Conflict(Ulid),
    #[error("reservation not found: {0}")]
    NotFound(Ulid),
}

impl StoreError {
    /// Transient faults may succeed if the same call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Wal(_))
    }
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Persist a new active reservation, assigning its id and timestamps.
    async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError>;

    async fn get_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// All reservations of a resource, ordered by start.
    async fn list_by_resource(&self, resource_id: Ulid) -> Result<Vec<Reservation>, StoreError>;

    /// All reservations of a holder, ordered by start.
    async fn list_by_holder(&self, holder_id: Ulid) -> Result<Vec<Reservation>, StoreError>;

    /// Active reservations of `resource_id` overlapping `span`, minus `exclude`.
    /// Must observe every insert/update that completed before the call.
    async fn list_active_overlapping(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Reservations lying entirely inside the calendar day `date` at `offset`,
    /// i.e. within `[midnight, midnight + 24h)`, ordered by start.
    async fn list_by_resource_and_date(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        offset: FixedOffset,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Active reservations starting strictly after `now`, across all
    /// resources, ascending by start.
    async fn list_upcoming(&self, now: Timestamp) -> Result<Vec<Reservation>, StoreError>;

    /// Replace span and status of an existing reservation and stamp
    /// `updated_at`. Resource and holder are never changed.
    async fn update(&self, record: Reservation) -> Result<Reservation, StoreError>;
}
