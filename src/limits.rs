/// Timestamps at or before this instant (Unix ms) are treated as unset.
pub const MIN_VALID_TIMESTAMP_MS: i64 = 0;

/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// Widest interval a single reservation may cover (366 days).
pub const MAX_SPAN_DURATION_MS: i64 = 366 * 24 * 3_600_000;

/// Bounded queue between callers and the WAL writer task.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;
