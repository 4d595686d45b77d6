//! In-memory store backend.
//!
//! Implements the same repository traits as the PostgreSQL adapters so the
//! server can run without a database (`STORE_BACKEND=memory`) and so the queue
//! and stream crates can be tested against a real store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use pgvector::Vector;
use tokio::sync::RwLock;
use uuid::Uuid;

use regula_core::{
    CheckRecord, CheckRepository, CheckStatus, DictionaryEntry, DictionaryRepository, Error,
    InputType, OcrStatus, OrganizationQuota, ProcessingStats, QuotaRepository, Result,
    ScanOutcome, Violation,
};

/// Monthly limit applied to organizations with no explicit allowance.
pub const DEFAULT_MONTHLY_LIMIT: i64 = 100;

#[derive(Debug, Clone)]
struct StoredEmbedding {
    vector: Vector,
    model: String,
}

#[derive(Default)]
struct Inner {
    checks: HashMap<Uuid, CheckRecord>,
    violations: HashMap<Uuid, Vec<Violation>>,
    monthly_limits: HashMap<Uuid, i64>,
    dictionary: HashMap<Uuid, DictionaryEntry>,
    embeddings: HashMap<Uuid, StoredEmbedding>,
}

/// Shared, cloneable in-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a check record.
    pub async fn insert_check(&self, record: CheckRecord) {
        self.inner.write().await.checks.insert(record.id, record);
    }

    /// Create a fresh `pending` record and return its id.
    pub async fn create_check(&self, organization_id: Uuid, input_type: InputType) -> Uuid {
        let record = CheckRecord::new(organization_id, input_type);
        let id = record.id;
        self.insert_check(record).await;
        id
    }

    pub async fn set_monthly_limit(&self, organization_id: Uuid, limit: i64) {
        self.inner
            .write()
            .await
            .monthly_limits
            .insert(organization_id, limit);
    }

    pub async fn insert_dictionary_entry(&self, entry: DictionaryEntry) {
        self.inner
            .write()
            .await
            .dictionary
            .insert(entry.id, entry);
    }

    /// Stored vector and model name for a dictionary entry, if any.
    pub async fn embedding(&self, id: Uuid) -> Option<(Vector, String)> {
        self.inner
            .read()
            .await
            .embeddings
            .get(&id)
            .map(|e| (e.vector.clone(), e.model.clone()))
    }

    /// Move a record to `next` and apply `apply` under one write lock. The
    /// closure also gets the violation table so a completion lands atomically.
    async fn transition<F>(&self, id: Uuid, next: CheckStatus, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut CheckRecord, &mut HashMap<Uuid, Vec<Violation>>),
    {
        let mut guard = self.inner.write().await;
        let Inner {
            checks, violations, ..
        } = &mut *guard;
        let record = checks.get_mut(&id).ok_or(Error::CheckNotFound(id))?;
        if !record.status.can_transition_to(next) {
            return Ok(false);
        }
        record.status = next;
        apply(record, violations);
        Ok(true)
    }
}

#[async_trait]
impl CheckRepository for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<CheckRecord>> {
        Ok(self.inner.read().await.checks.get(&id).cloned())
    }

    async fn violations(&self, id: Uuid) -> Result<Vec<Violation>> {
        Ok(self
            .inner
            .read()
            .await
            .violations
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn processing_stats(&self, organization_id: Uuid) -> Result<ProcessingStats> {
        let inner = self.inner.read().await;
        let mut stats = ProcessingStats::default();
        for record in inner.checks.values().filter(|r| {
            r.organization_id == organization_id && !r.status.is_terminal()
        }) {
            match record.input_type {
                InputType::Text => stats.text += 1,
                InputType::Image => stats.image += 1,
            }
        }
        Ok(stats)
    }

    async fn mark_processing(&self, id: Uuid) -> Result<()> {
        let moved = self
            .transition(id, CheckStatus::Processing, |record, _| {
                record.started_at.get_or_insert_with(Utc::now);
                if record.input_type == InputType::Image {
                    record.ocr_status = Some(OcrStatus::Processing);
                }
            })
            .await?;
        if !moved {
            return Err(Error::Conflict(format!("check {} is already terminal", id)));
        }
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid, outcome: &ScanOutcome) -> Result<()> {
        let moved = self
            .transition(id, CheckStatus::Completed, |record, violations| {
                if outcome.extracted_text.is_some() {
                    record.extracted_text = outcome.extracted_text.clone();
                }
                if outcome.ocr_status.is_some() {
                    record.ocr_status = outcome.ocr_status;
                }
                record.result = Some(outcome.result.clone());
                record.error_message = None;
                record.completed_at = Some(Utc::now());
                violations.insert(id, outcome.violations.clone());
            })
            .await?;
        if !moved {
            return Err(Error::Conflict(format!(
                "check {} is not awaiting a result",
                id
            )));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        self.transition(id, CheckStatus::Failed, |record, _| {
            record.error_message = Some(error.to_string());
            if matches!(
                record.ocr_status,
                Some(OcrStatus::Pending | OcrStatus::Processing)
            ) {
                record.ocr_status = Some(OcrStatus::Failed);
            }
            record.completed_at = Some(Utc::now());
        })
        .await
    }

    async fn fail_unfinished(&self, error: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut count = 0;
        for record in inner.checks.values_mut().filter(|r| !r.status.is_terminal()) {
            record.status = CheckStatus::Failed;
            record.error_message = Some(error.to_string());
            record.completed_at = Some(now);
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl QuotaRepository for MemoryStore {
    async fn quota(&self, organization_id: Uuid) -> Result<OrganizationQuota> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let current_month_checks = inner
            .checks
            .values()
            .filter(|r| {
                r.organization_id == organization_id
                    && r.created_at.year() == now.year()
                    && r.created_at.month() == now.month()
            })
            .count() as i64;
        Ok(OrganizationQuota {
            organization_id,
            monthly_limit: inner
                .monthly_limits
                .get(&organization_id)
                .copied()
                .unwrap_or(DEFAULT_MONTHLY_LIMIT),
            current_month_checks,
        })
    }
}

#[async_trait]
impl DictionaryRepository for MemoryStore {
    async fn list_ids(&self, organization_id: Uuid) -> Result<Vec<Uuid>> {
        let inner = self.inner.read().await;
        let mut ids: Vec<Uuid> = inner
            .dictionary
            .values()
            .filter(|e| e.organization_id == organization_id)
            .map(|e| e.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DictionaryEntry>> {
        Ok(self.inner.read().await.dictionary.get(&id).cloned())
    }

    async fn store_embedding(&self, id: Uuid, vector: Vector, model: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.dictionary.contains_key(&id) {
            return Err(Error::NotFound(format!("dictionary entry {}", id)));
        }
        inner.embeddings.insert(
            id,
            StoredEmbedding {
                vector,
                model: model.to_string(),
            },
        );
        Ok(())
    }
}
