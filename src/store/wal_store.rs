use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::*;
use crate::wal::Wal;

use super::writer::{wal_writer_loop, WalCommand};
use super::{ReservationStore, StoreError};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// WAL-backed store with in-memory indexes.
///
/// Each resource's reservations live behind their own `RwLock`. Writes take
/// the write lock, re-check the exclusion constraint, append to the WAL and only
/// then touch memory, so readers never see an uncommitted record. Commits run
/// on spawned tasks: a caller that goes away mid-write cannot split the WAL
/// from memory.
pub struct WalStore {
    inner: Arc<Inner>,
    replayed: usize,
    /// Events in the log not written by this process's last compaction:
    /// the replayed ones until the first compaction, then zero.
    uncompacted_base: AtomicU64,
}

struct Inner {
    resources: DashMap<Ulid, SharedResourceState>,
    /// reservation id → resource id
    by_id: DashMap<Ulid, Ulid>,
    /// holder id → reservation ids
    by_holder: DashMap<Ulid, Vec<Ulid>>,
    /// Writers share it, compaction takes it exclusively.
    compaction_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Pause for the next commit, taken after its exclusion check passes.
    #[cfg(test)]
    commit_pause: std::sync::Mutex<Option<std::time::Duration>>,
}

impl WalStore {
    /// Replay the WAL at `path` (created if absent) and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = Inner {
            resources: DashMap::new(),
            by_id: DashMap::new(),
            by_holder: DashMap::new(),
            compaction_gate: RwLock::new(()),
            wal_tx,
            #[cfg(test)]
            commit_pause: std::sync::Mutex::new(None),
        };

        // Nothing else can see these states yet, so build them unlocked.
        let mut states: HashMap<Ulid, ResourceState> = HashMap::new();
        for event in &events {
            let rid = event.resource_id();
            let rs = states.entry(rid).or_insert_with(|| ResourceState::new(rid));
            inner.apply(rs, event);
        }
        for (rid, rs) in states {
            inner.resources.insert(rid, Arc::new(RwLock::new(rs)));
        }

        tracing::info!(
            "opened reservation store {} ({} events, {} resources)",
            path.display(),
            events.len(),
            inner.resources.len()
        );
        Ok(Self {
            inner: Arc::new(inner),
            replayed: events.len(),
            uncompacted_base: AtomicU64::new(events.len() as u64),
        })
    }

    /// Number of events read from the WAL at open.
    pub fn replayed_events(&self) -> usize {
        self.replayed
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL with one creation event per reservation, plus an update
    /// event for every reservation changed since creation.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.inner.compaction_gate.write().await;

        let mut states = self.inner.snapshot();
        states.sort_by_key(|rs| rs.0);
        let mut events = Vec::new();
        for (rid, rs) in states {
            let guard = rs.read().await;
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    resource_id: rid,
                    holder_id: r.holder_id,
                    span: r.span,
                    created_at: r.created_at,
                });
                if !r.is_active() || r.updated_at != r.created_at {
                    events.push(Event::ReservationUpdated {
                        id: r.id,
                        resource_id: rid,
                        span: r.span,
                        status: r.status,
                        updated_at: r.updated_at,
                    });
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        self.uncompacted_base.store(0, Ordering::SeqCst);
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    /// Compact once at least `threshold` events sit in the log beyond what the
    /// last compaction wrote. Before any compaction, every replayed event counts.
    pub async fn compact_if_needed(&self, threshold: u64) -> Result<bool, StoreError> {
        let total = self.uncompacted_base.load(Ordering::SeqCst) + self.appends_since_compact().await;
        if total < threshold {
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }

    /// Stall the next commit while it holds the resource's write lock.
    #[cfg(test)]
    pub(crate) fn pause_next_commit(&self, pause: std::time::Duration) {
        if let Ok(mut slot) = self.inner.commit_pause.lock() {
            *slot = Some(pause);
        }
    }

    async fn run_commit<T, F>(&self, commit: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        tokio::spawn(commit)
            .await
            .map_err(|e| StoreError::Unavailable(format!("commit task failed: {e}")))?
    }
}

impl Inner {
    fn resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    fn resource_or_create(&self, id: Ulid) -> SharedResourceState {
        self.resources
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id))))
            .clone()
    }

    fn resource_for(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.by_id.get(reservation_id).map(|e| *e.value())
    }

    /// Clone out the resource handles so no map shard is held across an await.
    fn snapshot(&self) -> Vec<(Ulid, SharedResourceState)> {
        self.resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Apply an event to a resource. Caller holds the lock.
    fn apply(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ReservationCreated {
                id,
                resource_id,
                holder_id,
                span,
                created_at,
            } => {
                rs.insert(Reservation {
                    id: *id,
                    resource_id: *resource_id,
                    holder_id: *holder_id,
                    span: *span,
                    status: ReservationStatus::Active,
                    created_at: *created_at,
                    updated_at: *created_at,
                });
                self.by_id.insert(*id, *resource_id);
                self.by_holder.entry(*holder_id).or_default().push(*id);
            }
            Event::ReservationUpdated {
                id,
                span,
                status,
                updated_at,
                ..
            } => {
                // Removed and reinserted: the start may have moved.
                if let Some(mut r) = rs.remove(*id) {
                    r.span = *span;
                    r.status = *status;
                    r.updated_at = *updated_at;
                    rs.insert(r);
                }
            }
        }
    }

    #[cfg(test)]
    async fn take_pause(&self) {
        let pause = self.commit_pause.lock().ok().and_then(|mut slot| slot.take());
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    async fn commit_insert(self: Arc<Self>, new: NewReservation) -> Result<Reservation, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let rs = self.resource_or_create(new.resource_id);
        let mut guard = rs.write().await;

        if let Some(existing) = guard.active_overlapping(&new.span, None).next() {
            return Err(StoreError::Conflict(existing.id));
        }
        #[cfg(test)]
        self.take_pause().await;

        let id = Ulid::new();
        let event = Event::ReservationCreated {
            id,
            resource_id: new.resource_id,
            holder_id: new.holder_id,
            span: new.span,
            created_at: now(),
        };
        self.wal_append(&event).await?;
        self.apply(&mut guard, &event);
        guard
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn commit_update(self: Arc<Self>, record: Reservation) -> Result<Reservation, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let resource_id = self
            .resource_for(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;
        let rs = self
            .resource(&resource_id)
            .ok_or(StoreError::NotFound(record.id))?;
        let mut guard = rs.write().await;
        if guard.get(record.id).is_none() {
            return Err(StoreError::NotFound(record.id));
        }

        if record.is_active()
            && let Some(existing) = guard.active_overlapping(&record.span, Some(record.id)).next()
        {
            return Err(StoreError::Conflict(existing.id));
        }

        let event = Event::ReservationUpdated {
            id: record.id,
            resource_id,
            span: record.span,
            status: record.status,
            updated_at: now(),
        };
        self.wal_append(&event).await?;
        self.apply(&mut guard, &event);
        guard
            .get(record.id)
            .cloned()
            .ok_or(StoreError::NotFound(record.id))
    }
}

#[async_trait]
impl ReservationStore for WalStore {
    async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        self.run_commit(self.inner.clone().commit_insert(new)).await
    }

    async fn get_by_id(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let Some(rs) = self.inner.resource_for(&id).and_then(|rid| self.inner.resource(&rid)) else {
            return Ok(None);
        };
        let guard = rs.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn list_by_resource(&self, resource_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        let Some(rs) = self.inner.resource(&resource_id) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        Ok(guard.reservations.clone())
    }

    async fn list_by_holder(&self, holder_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        let ids = self
            .inner
            .by_holder
            .get(&holder_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.get_by_id(id).await? {
                out.push(r);
            }
        }
        out.sort_by_key(|r| r.span.start);
        Ok(out)
    }

    async fn list_active_overlapping(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let Some(rs) = self.inner.resource(&resource_id) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        Ok(guard.active_overlapping(&span, exclude).cloned().collect())
    }

    async fn list_by_resource_and_date(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        offset: FixedOffset,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let Some(rs) = self.inner.resource(&resource_id) else {
            return Ok(Vec::new());
        };
        // A day chrono cannot represent holds no reservations.
        let Some(window) = day_window(date, offset) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        Ok(guard
            .overlapping(&window)
            .filter(|r| window.contains_span(&r.span))
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect())
    }

    async fn list_upcoming(&self, now: Timestamp) -> Result<Vec<Reservation>, StoreError> {
        let mut out = Vec::new();
        for (_, rs) in self.inner.snapshot() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.is_active() && r.span.start > now)
                    .cloned(),
            );
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn update(&self, record: Reservation) -> Result<Reservation, StoreError> {
        self.run_commit(self.inner.clone().commit_update(record)).await
    }
}
