use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "reservd_operations_total";

/// Histogram: engine operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "reservd_operation_duration_seconds";

/// Counter: create/update attempts rejected because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "reservd_slot_conflicts_total";

// ── Store health ────────────────────────────────────────────────

/// Counter: read retries after a transient store fault. Labels: op.
pub const STORE_RETRIES_TOTAL: &str = "reservd_store_retries_total";

/// Counter: store calls, directory lookups or lock waits that hit their deadline. Labels: op.
pub const STORE_TIMEOUTS_TOTAL: &str = "reservd_store_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
