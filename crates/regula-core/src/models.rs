//! Core data models for regula.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub use pgvector::Vector;

use crate::defaults;

// =============================================================================
// SCAN QUEUE TYPES
// =============================================================================

/// Admission-order hint for scan jobs.
///
/// Affects dispatch order only: `High` items are dispatched ahead of every
/// waiting `Normal` and `Low` item, and order within a tier is FIFO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Kind of content submitted for a compliance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Text,
    Image,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            _ => Err(format!("Invalid input type: {}", s)),
        }
    }
}

/// One admitted scan job, owned by the scan queue while queued or in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanQueueItem {
    /// Id of the persisted check record this job scans.
    pub id: Uuid,
    pub payload: JsonValue,
    pub organization_id: Uuid,
    pub priority: Priority,
    pub kind: InputType,
    pub created_at: DateTime<Utc>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Retries granted after the first attempt.
    pub max_retries: u32,
}

impl ScanQueueItem {
    pub fn new(
        id: Uuid,
        payload: JsonValue,
        organization_id: Uuid,
        priority: Priority,
        kind: InputType,
    ) -> Self {
        Self {
            id,
            payload,
            organization_id,
            priority,
            kind,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: defaults::SCAN_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether another attempt is allowed after `retry_count` failures.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count <= self.max_retries
    }
}

/// Scan queue metrics as returned by `ScanQueue::status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub processing_count: usize,
    pub max_concurrent: usize,
}

impl QueueStatus {
    pub fn available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.processing_count)
    }
}

// =============================================================================
// CHECK RECORDS (persisted, owned by the store)
// =============================================================================

/// Lifecycle of a persisted compliance check.
///
/// `pending → processing → {completed | failed}`; `pending | processing → failed`
/// on cancellation or retry exhaustion. No transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the record may move from `self` to `next`.
    pub fn can_transition_to(&self, next: CheckStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Processing) => true,
            (Self::Pending | Self::Processing, Self::Completed | Self::Failed) => true,
            // A retried attempt re-enters processing.
            (Self::Processing, Self::Processing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid check status: {}", s)),
        }
    }
}

/// OCR sub-status for image checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for OcrStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid OCR status: {}", s)),
        }
    }
}

/// A persisted compliance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub status: CheckStatus,
    pub input_type: InputType,
    pub ocr_status: Option<OcrStatus>,
    pub extracted_text: Option<String>,
    pub error_message: Option<String>,
    /// Scanner summary, present once completed.
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CheckRecord {
    /// A fresh `pending` record.
    pub fn new(organization_id: Uuid, input_type: InputType) -> Self {
        Self {
            id: Uuid::now_v7(),
            organization_id,
            status: CheckStatus::Pending,
            input_type,
            ocr_status: match input_type {
                InputType::Image => Some(OcrStatus::Pending),
                InputType::Text => None,
            },
            extracted_text: None,
            error_message: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One regulatory finding produced by a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub category: String,
    pub severity: String,
    /// Offending passage from the submitted content.
    pub excerpt: String,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Input handed to the scanning backend.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRequest {
    pub check_id: Uuid,
    pub organization_id: Uuid,
    pub input_type: InputType,
    pub payload: JsonValue,
}

impl From<&ScanQueueItem> for ScanRequest {
    fn from(item: &ScanQueueItem) -> Self {
        Self {
            check_id: item.id,
            organization_id: item.organization_id,
            input_type: item.kind,
            payload: item.payload.clone(),
        }
    }
}

/// Everything a successful scan persists onto its record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub ocr_status: Option<OcrStatus>,
    #[serde(default)]
    pub result: JsonValue,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

/// Pending + processing record counts per input type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub text: i64,
    pub image: i64,
}

/// Monthly usage ceiling for one organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationQuota {
    pub organization_id: Uuid,
    pub monthly_limit: i64,
    pub current_month_checks: i64,
}

impl OrganizationQuota {
    pub fn remaining_checks(&self) -> i64 {
        (self.monthly_limit - self.current_month_checks).max(0)
    }

    pub fn can_perform_check(&self) -> bool {
        self.remaining_checks() > 0
    }
}

// =============================================================================
// DICTIONARY / EMBEDDING JOBS
// =============================================================================

/// A dictionary phrase whose embedding can be regenerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub phrase: String,
}

/// What an embedding job was asked to cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingTarget {
    /// Every dictionary entry of the organization at enqueue time.
    All,
    /// An explicit set of dictionary entries.
    Ids(Vec<Uuid>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingJobStatus {
    Pending,
    Processing,
    Completed,
}

/// A batch "regenerate embeddings" job.
///
/// Invariants: `failed <= processed <= total`; `status == Completed` exactly
/// when `processed == total`. Counters only increase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub target: EmbeddingTarget,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub status: EmbeddingJobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl EmbeddingJob {
    /// New job over `total` resolved items. An empty job is complete at birth.
    pub fn new(organization_id: Uuid, target: EmbeddingTarget, total: usize) -> Self {
        let now = Utc::now();
        let (status, completed_at) = if total == 0 {
            (EmbeddingJobStatus::Completed, Some(now))
        } else {
            (EmbeddingJobStatus::Pending, None)
        };
        Self {
            id: Uuid::now_v7(),
            organization_id,
            target,
            total,
            processed: 0,
            failed: 0,
            status,
            created_at: now,
            completed_at,
        }
    }

    /// Move a pending job to processing. No-op once processing or completed.
    pub fn start(&mut self) {
        if self.status == EmbeddingJobStatus::Pending {
            self.status = EmbeddingJobStatus::Processing;
        }
    }

    /// Count one finished item. Ignored once every item is accounted for.
    pub fn record(&mut self, success: bool) {
        if self.processed >= self.total {
            return;
        }
        self.start();
        self.processed += 1;
        if !success {
            self.failed += 1;
        }
        if self.processed == self.total {
            self.status = EmbeddingJobStatus::Completed;
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == EmbeddingJobStatus::Completed
    }
}

/// One unit of managed-queue work: embed a single dictionary entry for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingTask {
    pub job_id: Uuid,
    pub organization_id: Uuid,
    pub dictionary_id: Uuid,
}
