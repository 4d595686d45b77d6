//! Centralized default constants for regula.
//!
//! **This module is the single source of truth** for shared default values.
//! Component configs (`ScanQueueConfig`, `StreamConfig`, ...) start from these
//! and may be overridden from the environment.

// =============================================================================
// SCAN QUEUE
// =============================================================================

/// Number of scan jobs that may be in flight at once.
pub const SCAN_MAX_CONCURRENT: usize = 3;

/// Retries granted after the first attempt of a scan job.
pub const SCAN_MAX_RETRIES: u32 = 2;

/// Base multiplier (seconds) for the `2^retry_count` backoff.
pub const SCAN_BACKOFF_BASE_SECS: u64 = 1;

/// Upper bound (seconds) on any single retry delay.
pub const SCAN_BACKOFF_MAX_SECS: u64 = 60;

/// Per-attempt timeout for a scan job.
pub const SCAN_JOB_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// EMBEDDING QUEUE
// =============================================================================

/// Dictionary items embedded concurrently within one in-process job.
pub const EMBEDDING_ITEM_CONCURRENCY: usize = 4;

/// Delivery attempts granted by the managed queue per item.
pub const MANAGED_QUEUE_RETRIES: u32 = 3;

/// Initial backoff (seconds) handed to the managed queue.
pub const MANAGED_QUEUE_BACKOFF_SECS: u64 = 30;

// =============================================================================
// STATUS STREAM
// =============================================================================

/// Poll interval for aggregate queue-status streams.
pub const STREAM_POLL_INTERVAL_SECS: u64 = 5;

/// Fallback poll interval for single-record streams.
pub const STREAM_CHECK_POLL_INTERVAL_SECS: u64 = 2;

/// Heartbeat comment interval.
pub const STREAM_HEARTBEAT_SECS: u64 = 30;

/// Hard ceiling on a stream connection's lifetime (10 minutes).
pub const STREAM_MAX_DURATION_SECS: u64 = 600;

/// Outbound frame buffer per connection.
pub const STREAM_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// EVENT BUS
// =============================================================================

/// Default broadcast buffer for change notifications.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// PostgreSQL NOTIFY channel carrying record transitions.
pub const CHECK_NOTIFY_CHANNEL: &str = "check_updates";

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;
