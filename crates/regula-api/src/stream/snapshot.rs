//! Status frames and the read-only aggregation that builds them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use regula_core::{
    CheckRecord, CheckRepository, CheckStatus, Error, InputType, OcrStatus, ProcessingStats,
    QueueStatus, QuotaRepository, Result, Violation,
};
use regula_jobs::ScanQueue;

/// One pushed status frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    CheckProgress {
        timestamp: DateTime<Utc>,
        check: CheckView,
    },
    QueueStatus {
        timestamp: DateTime<Utc>,
        queue: QueueView,
        organization: OrganizationView,
        system: SystemView,
    },
}

impl Frame {
    /// Final frame for a single-record stream.
    pub fn is_terminal(&self) -> bool {
        match self {
            Frame::CheckProgress { check, .. } => check.status.is_terminal(),
            Frame::QueueStatus { .. } => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::CheckProgress { .. } => "check_progress",
            Frame::QueueStatus { .. } => "queue_status",
        }
    }

    /// Digest of the frame body with `timestamp` left out, so two
    /// recomputations of unchanged state compare equal.
    pub fn content_digest(&self) -> Result<blake3::Hash> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("timestamp");
        }
        Ok(blake3::hash(&serde_json::to_vec(&value)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckView {
    pub id: Uuid,
    pub status: CheckStatus,
    pub input_type: InputType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_status: Option<OcrStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<Violation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CheckView {
    fn progress(record: CheckRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            input_type: record.input_type,
            ocr_status: record.ocr_status,
            extracted_text: record.extracted_text,
            error_message: record.error_message,
            result: None,
            violations: None,
            completed_at: None,
        }
    }

    fn finished(record: CheckRecord, violations: Vec<Violation>) -> Self {
        let result = record.result.clone();
        let completed_at = record.completed_at;
        let mut view = Self::progress(record);
        view.result = result;
        view.violations = Some(violations);
        view.completed_at = completed_at;
        view
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueView {
    pub queue_length: usize,
    pub processing_count: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub processing_stats: ProcessingStats,
    pub can_start_new_check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationView {
    pub monthly_limit: i64,
    pub current_month_checks: i64,
    pub remaining_checks: i64,
    pub can_perform_check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemView {
    pub server_load: ServerLoad,
}

/// `queue` is the pending count; `processing` is slot utilisation in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ServerLoad {
    pub queue: usize,
    pub processing: u32,
}

impl ServerLoad {
    fn from_status(status: &QueueStatus) -> Self {
        let processing = if status.max_concurrent == 0 {
            0
        } else {
            (status.processing_count * 100 / status.max_concurrent) as u32
        };
        Self {
            queue: status.queue_length,
            processing,
        }
    }
}

/// Recomputes status frames on demand from the scan queue and the store.
#[derive(Clone)]
pub struct StatusSnapshot {
    queue: ScanQueue,
    checks: Arc<dyn CheckRepository>,
    quotas: Arc<dyn QuotaRepository>,
}

impl StatusSnapshot {
    pub fn new(
        queue: ScanQueue,
        checks: Arc<dyn CheckRepository>,
        quotas: Arc<dyn QuotaRepository>,
    ) -> Self {
        Self {
            queue,
            checks,
            quotas,
        }
    }

    /// Aggregate frame for one organization.
    pub async fn queue_status(&self, organization_id: Uuid) -> Result<Frame> {
        let status = self.queue.status().await;
        let stats = self.checks.processing_stats(organization_id).await?;
        let quota = self.quotas.quota(organization_id).await?;

        let available_slots = status.available_slots();
        Ok(Frame::QueueStatus {
            timestamp: Utc::now(),
            queue: QueueView {
                queue_length: status.queue_length,
                processing_count: status.processing_count,
                max_concurrent: status.max_concurrent,
                available_slots,
                processing_stats: stats,
                can_start_new_check: available_slots > 0,
            },
            organization: OrganizationView {
                monthly_limit: quota.monthly_limit,
                current_month_checks: quota.current_month_checks,
                remaining_checks: quota.remaining_checks(),
                can_perform_check: quota.can_perform_check(),
            },
            system: SystemView {
                server_load: ServerLoad::from_status(&status),
            },
        })
    }

    /// Progress frame for one record. A terminal record yields the full
    /// result, including violations for a completed scan.
    pub async fn check_progress(&self, check_id: Uuid) -> Result<Frame> {
        let record = self
            .checks
            .get(check_id)
            .await?
            .ok_or(Error::CheckNotFound(check_id))?;

        let check = match record.status {
            CheckStatus::Completed => {
                let violations = self.checks.violations(check_id).await?;
                CheckView::finished(record, violations)
            }
            CheckStatus::Failed => CheckView::finished(record, Vec::new()),
            _ => CheckView::progress(record),
        };

        Ok(Frame::CheckProgress {
            timestamp: Utc::now(),
            check,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_frame(queue_length: usize) -> Frame {
        let status = QueueStatus {
            queue_length,
            processing_count: 2,
            max_concurrent: 3,
        };
        Frame::QueueStatus {
            timestamp: Utc::now(),
            queue: QueueView {
                queue_length,
                processing_count: 2,
                max_concurrent: 3,
                available_slots: 1,
                processing_stats: ProcessingStats { text: 2, image: 1 },
                can_start_new_check: true,
            },
            organization: OrganizationView {
                monthly_limit: 100,
                current_month_checks: 3,
                remaining_checks: 97,
                can_perform_check: true,
            },
            system: SystemView {
                server_load: ServerLoad::from_status(&status),
            },
        }
    }

    #[test]
    fn test_queue_status_wire_shape() {
        let json = serde_json::to_value(queue_frame(4)).unwrap();
        assert_eq!(json["type"], "queue_status");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["queue"]["queueLength"], 4);
        assert_eq!(json["queue"]["availableSlots"], 1);
        assert_eq!(json["queue"]["processingStats"]["image"], 1);
        assert_eq!(json["queue"]["canStartNewCheck"], true);
        assert_eq!(json["organization"]["remainingChecks"], 97);
        assert_eq!(json["system"]["serverLoad"]["queue"], 4);
        assert_eq!(json["system"]["serverLoad"]["processing"], 66);
    }

    #[test]
    fn test_digest_ignores_timestamp() {
        let a = queue_frame(1);
        let mut b = queue_frame(1);
        if let Frame::QueueStatus { timestamp, .. } = &mut b {
            *timestamp += chrono::Duration::seconds(5);
        }
        assert_ne!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
        assert_eq!(a.content_digest().unwrap(), b.content_digest().unwrap());
        assert_ne!(
            a.content_digest().unwrap(),
            queue_frame(2).content_digest().unwrap()
        );
    }

    #[test]
    fn test_check_progress_omits_absent_fields() {
        let record = CheckRecord::new(Uuid::nil(), InputType::Text);
        let frame = Frame::CheckProgress {
            timestamp: Utc::now(),
            check: CheckView::progress(record),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "check_progress");
        assert_eq!(json["check"]["status"], "pending");
        assert_eq!(json["check"]["input_type"], "text");
        assert!(json["check"].get("ocr_status").is_none());
        assert!(json["check"].get("violations").is_none());
        assert!(!frame.is_terminal());
    }

    #[test]
    fn test_server_load_with_no_slots() {
        let load = ServerLoad::from_status(&QueueStatus::default());
        assert_eq!(load.processing, 0);
    }
}
