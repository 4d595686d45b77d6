//! Structured logging schema and field name constants for regula.
//!
//! All crates use these names for structured `tracing` fields so log
//! aggregation can query scheduler activity uniformly.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Retries, abandoned items, lagged subscribers |
//! | INFO  | Lifecycle events (queue start/stop, stream open/close, job completion) |
//! | DEBUG | Dispatch decisions, frame emission, config choices |
//! | TRACE | Per-item embedding work |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "api", "db", "inference", "jobs", "stream"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "scan_queue", "embedding_queue", "fanout", "listener"
pub const COMPONENT: &str = "component";

/// Logical operation name.
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Compliance check (scan record) UUID.
pub const CHECK_ID: &str = "check_id";

/// Embedding job UUID.
pub const JOB_ID: &str = "job_id";

/// Tenant UUID.
pub const ORGANIZATION_ID: &str = "organization_id";

/// Dictionary entry UUID.
pub const DICTIONARY_ID: &str = "dictionary_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of retries already consumed by a scan job.
pub const RETRY_COUNT: &str = "retry_count";

/// Delay before the next attempt, in milliseconds.
pub const BACKOFF_MS: &str = "backoff_ms";

/// Pending items in a queue.
pub const QUEUE_LENGTH: &str = "queue_length";

/// In-flight items in a queue.
pub const PROCESSING_COUNT: &str = "processing_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Why a stream connection closed.
pub const CLOSE_REASON: &str = "close_reason";
