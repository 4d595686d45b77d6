//! # regula-jobs
//!
//! Background scheduling for regula.
//!
//! This crate provides:
//! - [`ScanQueue`]: priority admission and bounded-concurrency dispatch of
//!   compliance scans, with bounded exponential backoff and cancellation
//! - [`ComplianceScanWorker`]: the default [`ScanWorker`]
//! - [`EmbeddingJobQueue`]: batch regeneration of dictionary embeddings,
//!   in-process or through a [`ManagedQueue`]
//! - [`DelayedTask`]: cancellable timer used for retries
//!
//! ## Example
//!
//! ```ignore
//! use regula_jobs::{ComplianceScanWorker, ScanQueue, ScanQueueConfig};
//!
//! let worker = ComplianceScanWorker::new(checks, scanner);
//! let queue = ScanQueue::start(ScanQueueConfig::from_env(), Arc::new(worker));
//!
//! queue.enqueue(check_id, payload, org_id, Priority::High, InputType::Text).await?;
//! let status = queue.status().await;
//!
//! // Graceful shutdown
//! queue.shutdown().await;
//! ```

pub mod delay;
pub mod embedding_queue;
pub mod managed_queue;
pub mod scan_queue;
pub mod worker;

// Re-export core types
pub use regula_core::*;

pub use delay::DelayedTask;
pub use embedding_queue::{
    DeliveryOutcome, EmbeddingJobQueue, EmbeddingQueueBackend, EmbeddingQueueConfig,
};
pub use managed_queue::{HttpManagedQueue, ManagedQueue, ManagedQueueConfig, ATTEMPT_HEADER};
pub use scan_queue::{ScanQueue, ScanQueueConfig, CANCELLED_MESSAGE, SHUTDOWN_MESSAGE};
pub use worker::{ComplianceScanWorker, ScanWorker};
