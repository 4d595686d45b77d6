//! Core traits for regula abstractions.
//!
//! These are the narrow interfaces through which the scheduler reaches the
//! relational store and the external AI providers. Concrete implementations
//! live in `regula-db` and `regula-inference`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// STORE TRAITS
// =============================================================================

/// Read/write access to persisted compliance check records.
#[async_trait]
pub trait CheckRepository: Send + Sync {
    /// Read a record by id.
    async fn get(&self, id: Uuid) -> Result<Option<CheckRecord>>;

    /// Violations recorded for a completed check.
    async fn violations(&self, id: Uuid) -> Result<Vec<Violation>>;

    /// Pending + processing record counts per input type for an organization.
    async fn processing_stats(&self, organization_id: Uuid) -> Result<ProcessingStats>;

    /// Move a record to `processing` and stamp `started_at`.
    async fn mark_processing(&self, id: Uuid) -> Result<()>;

    /// Persist a successful scan and move the record to `completed`.
    async fn mark_completed(&self, id: Uuid, outcome: &ScanOutcome) -> Result<()>;

    /// Move a non-terminal record to `failed` with a human-readable message.
    ///
    /// Returns `false` when the record was already terminal.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool>;

    /// Fail every `pending`/`processing` record. Used at startup to release
    /// work orphaned by a previous process when the queue is memory-resident.
    async fn fail_unfinished(&self, error: &str) -> Result<u64>;
}

/// Tenant quota lookup.
#[async_trait]
pub trait QuotaRepository: Send + Sync {
    async fn quota(&self, organization_id: Uuid) -> Result<OrganizationQuota>;
}

/// Dictionary phrases and their stored embeddings.
#[async_trait]
pub trait DictionaryRepository: Send + Sync {
    /// Ids of every dictionary entry owned by the organization.
    async fn list_ids(&self, organization_id: Uuid) -> Result<Vec<Uuid>>;

    async fn get(&self, id: Uuid) -> Result<Option<DictionaryEntry>>;

    /// Replace the stored vector for an entry.
    async fn store_embedding(&self, id: Uuid, vector: Vector, model: &str) -> Result<()>;
}

// =============================================================================
// PROVIDER TRAITS
// =============================================================================

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for a batch of texts.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>>;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;

    /// Get the model name.
    fn model_name(&self) -> &str;
}

/// Backend that performs the actual compliance analysis for one check.
#[async_trait]
pub trait ScanBackend: Send + Sync {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanOutcome>;
}
