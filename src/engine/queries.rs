use std::time::Instant;

use chrono::{FixedOffset, NaiveDate};
use futures::future::{join, join_all};
use tokio::time::timeout;
use ulid::Ulid;

use crate::model::*;
use crate::observability::STORE_TIMEOUTS_TOTAL;

use super::{record_outcome, Engine, EngineError};

fn with_status(reservations: Vec<Reservation>, status: Option<ReservationStatus>) -> Vec<Reservation> {
    match status {
        Some(s) => reservations.into_iter().filter(|r| r.status == s).collect(),
        None => reservations,
    }
}

impl Engine {
    pub async fn get(&self, id: Ulid) -> Result<ReservationView, EngineError> {
        let started = Instant::now();
        let result = self
            .read("get_by_id", || self.store.get_by_id(id))
            .await
            .and_then(|found| found.ok_or(EngineError::NotFound(id)));
        record_outcome("get", started, &result);
        Ok(self.enrich_one(result?).await)
    }

    /// Every reservation of a resource, ordered by start.
    pub async fn by_resource(
        &self,
        resource_id: Ulid,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<ReservationView>, EngineError> {
        let started = Instant::now();
        let result = self
            .read("list_by_resource", || self.store.list_by_resource(resource_id))
            .await
            .map(|list| with_status(list, status));
        record_outcome("by_resource", started, &result);
        Ok(self.enrich(result?).await)
    }

    /// Every reservation made by a holder, ordered by start.
    pub async fn by_holder(
        &self,
        holder_id: Ulid,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<ReservationView>, EngineError> {
        let started = Instant::now();
        let result = self
            .read("list_by_holder", || self.store.list_by_holder(holder_id))
            .await
            .map(|list| with_status(list, status));
        record_outcome("by_holder", started, &result);
        Ok(self.enrich(result?).await)
    }

    /// Active reservations starting after `now`, across all resources.
    pub async fn upcoming(&self, now: Timestamp) -> Result<Vec<ReservationView>, EngineError> {
        let started = Instant::now();
        let result = self
            .read("list_upcoming", || self.store.list_upcoming(now))
            .await;
        record_outcome("upcoming", started, &result);
        Ok(self.enrich(result?).await)
    }

    /// Reservations of a resource lying within the calendar day `date` at
    /// `offset`, i.e. inside `[midnight, midnight + 24h)`.
    pub async fn by_resource_and_date(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        offset: FixedOffset,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<ReservationView>, EngineError> {
        let started = Instant::now();
        let result = self
            .read("list_by_resource_and_date", || {
                self.store
                    .list_by_resource_and_date(resource_id, date, offset, status)
            })
            .await;
        record_outcome("by_resource_and_date", started, &result);
        Ok(self.enrich(result?).await)
    }

    /// Join reservations with their resource and holder from the directory.
    pub async fn enrich(&self, reservations: Vec<Reservation>) -> Vec<ReservationView> {
        join_all(reservations.into_iter().map(|r| self.enrich_one(r))).await
    }

    async fn enrich_one(&self, reservation: Reservation) -> ReservationView {
        let (resource, holder) = join(
            self.lookup(
                "directory_resource",
                reservation.resource_id,
                self.directory.resource(reservation.resource_id),
            ),
            self.lookup(
                "directory_holder",
                reservation.holder_id,
                self.directory.holder(reservation.holder_id),
            ),
        )
        .await;
        ReservationView {
            reservation,
            resource,
            holder,
        }
    }

    /// Directory read bounded by `store_timeout`. A lookup that runs out of
    /// time leaves that part of the view empty.
    async fn lookup<T>(
        &self,
        op: &'static str,
        id: Ulid,
        call: impl Future<Output = Option<T>>,
    ) -> Option<T> {
        match timeout(self.config.store_timeout, call).await {
            Ok(found) => found,
            Err(_) => {
                metrics::counter!(STORE_TIMEOUTS_TOTAL, "op" => op).increment(1);
                tracing::warn!("{op} for {id} timed out after {:?}", self.config.store_timeout);
                None
            }
        }
    }
}
