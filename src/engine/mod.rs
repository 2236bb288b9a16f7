mod conflict;
mod error;
mod locks;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OwnedMutexGuard;
use tokio::time::{sleep, timeout};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::directory::Directory;
use crate::observability::*;
use crate::store::{ReservationStore, StoreError, WalStore};

use locks::ResourceLocks;

/// The reservation engine.
///
/// Holds no reservation state of its own: every decision is made against the
/// store while the affected resource's lock is held, so two overlapping
/// creates or updates on one resource can never both commit. The store's own
/// exclusion constraint backs this up for commits that outlive their caller.
pub struct Engine {
    store: Arc<dyn ReservationStore>,
    directory: Arc<dyn Directory>,
    locks: ResourceLocks,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        directory: Arc<dyn Directory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            directory,
            locks: ResourceLocks::default(),
            config,
        }
    }

    /// Engine over a [`WalStore`] at `wal_path`. Must be called inside a tokio runtime.
    pub fn open(
        wal_path: &Path,
        directory: Arc<dyn Directory>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let store = Arc::new(WalStore::open(wal_path)?);
        Ok(Self::new(store, directory, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Acquire the resource's lock within `lock_timeout`.
    async fn lock_resource(&self, resource_id: Ulid) -> Result<OwnedMutexGuard<()>, EngineError> {
        match timeout(self.config.lock_timeout, self.locks.acquire(resource_id)).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(STORE_TIMEOUTS_TOTAL, "op" => "lock").increment(1);
                tracing::warn!("timed out waiting for lock on resource {resource_id}");
                Err(EngineError::StoreUnavailable(format!(
                    "resource {resource_id} busy for {:?}",
                    self.config.lock_timeout
                )))
            }
        }
    }

    /// Run a read against the store with a deadline, retrying transient
    /// failures up to `read_retries` times with doubling backoff.
    async fn read<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match timeout(self.config.store_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() => e,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    metrics::counter!(STORE_TIMEOUTS_TOTAL, "op" => op).increment(1);
                    StoreError::Unavailable(format!("{op} timed out after {:?}", self.config.store_timeout))
                }
            };
            if attempt >= self.config.read_retries {
                tracing::warn!("{op} failed after {} attempts: {err}", attempt + 1);
                return Err(err.into());
            }
            let backoff = self.config.retry_backoff.saturating_mul(1 << attempt.min(16));
            metrics::counter!(STORE_RETRIES_TOTAL, "op" => op).increment(1);
            tracing::debug!("{op} transient failure ({err}), retry in {backoff:?}");
            sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Run a write against the store with a deadline. Writes are never
    /// retried here: the caller decides whether to try again.
    async fn write<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, EngineError> {
        match timeout(self.config.store_timeout, call).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => {
                metrics::counter!(STORE_TIMEOUTS_TOTAL, "op" => op).increment(1);
                tracing::warn!("{op} timed out after {:?}", self.config.store_timeout);
                Err(EngineError::StoreUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.config.store_timeout
                )))
            }
        }
    }
}

/// Record count + latency for one public operation.
fn record_outcome<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    if matches!(result, Err(EngineError::SlotUnavailable(_))) {
        metrics::counter!(SLOT_CONFLICTS_TOTAL).increment(1);
    }
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
}
