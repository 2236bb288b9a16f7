use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

/// One exclusive lock per resource, held across check-then-act.
///
/// Entries are created on first use and kept; a lock is a few bytes and
/// resources are long-lived.
#[derive(Default)]
pub(super) struct ResourceLocks {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl ResourceLocks {
    pub(super) async fn acquire(&self, resource_id: Ulid) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is released before we wait.
        let lock = self.locks.entry(resource_id).or_default().clone();
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.locks.len()
    }
}
