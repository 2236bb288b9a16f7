use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Bounds the engine puts on store calls and lock waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    /// Upper bound on waiting for a resource's lock.
    pub lock_timeout: Duration,
    /// Extra attempts for read paths after a transient store fault.
    pub read_retries: u32,
    /// Backoff before the first retry; doubles on each further attempt.
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(5),
            read_retries: 3,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            store_timeout: Duration::from_millis(env_or(
                "RESERVD_STORE_TIMEOUT_MS",
                d.store_timeout.as_millis() as u64,
            )),
            lock_timeout: Duration::from_millis(env_or(
                "RESERVD_LOCK_TIMEOUT_MS",
                d.lock_timeout.as_millis() as u64,
            )),
            read_retries: env_or("RESERVD_READ_RETRIES", d.read_retries),
            retry_backoff: Duration::from_millis(env_or(
                "RESERVD_RETRY_BACKOFF_MS",
                d.retry_backoff.as_millis() as u64,
            )),
        }
    }
}

/// Process-level settings for the `reservd` binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Compact the WAL at startup once it holds this many events.
    pub compact_threshold: u64,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(env_or("RESERVD_DATA_DIR", "./data".to_string())),
            metrics_port: std::env::var("RESERVD_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            compact_threshold: env_or("RESERVD_COMPACT_THRESHOLD", 1000),
            engine: EngineConfig::from_env(),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}
