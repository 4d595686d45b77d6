//! Compliance check repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use regula_core::{
    CheckRecord, CheckRepository, CheckStatus, Error, InputType, OcrStatus, ProcessingStats,
    Result, ScanOutcome, Violation,
};

const CHECK_COLUMNS: &str = "id, organization_id, status, input_type, ocr_status, extracted_text, \
     error_message, result, created_at, started_at, completed_at";

/// PostgreSQL implementation of CheckRepository.
#[derive(Clone)]
pub struct PgCheckRepository {
    pool: Pool<Postgres>,
}

impl PgCheckRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Insert a new record (used by the check-creation path and tests).
    pub async fn insert(&self, record: &CheckRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO compliance_checks (id, organization_id, status, input_type, ocr_status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(record.organization_id)
        .bind(record.status.as_str())
        .bind(record.input_type.as_str())
        .bind(record.ocr_status.map(|s| s.as_str()))
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    /// Parse a check row into a CheckRecord.
    fn parse_check_row(row: sqlx::postgres::PgRow) -> Result<CheckRecord> {
        let status: String = row.get("status");
        let input_type: String = row.get("input_type");
        let ocr_status: Option<String> = row.get("ocr_status");

        Ok(CheckRecord {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            status: status.parse::<CheckStatus>().map_err(Error::Internal)?,
            input_type: input_type.parse::<InputType>().map_err(Error::Internal)?,
            ocr_status: ocr_status
                .map(|s| s.parse::<OcrStatus>())
                .transpose()
                .map_err(Error::Internal)?,
            extracted_text: row.get("extracted_text"),
            error_message: row.get("error_message"),
            result: row.get("result"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

#[async_trait]
impl CheckRepository for PgCheckRepository {
    async fn get(&self, id: Uuid) -> Result<Option<CheckRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM compliance_checks WHERE id = $1",
            CHECK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_check_row).transpose()
    }

    async fn violations(&self, id: Uuid) -> Result<Vec<Violation>> {
        let rows = sqlx::query(
            "SELECT category, severity, excerpt, explanation, suggestion
             FROM check_violations WHERE check_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| Violation {
                category: row.get("category"),
                severity: row.get("severity"),
                excerpt: row.get("excerpt"),
                explanation: row.get("explanation"),
                suggestion: row.get("suggestion"),
            })
            .collect())
    }

    async fn processing_stats(&self, organization_id: Uuid) -> Result<ProcessingStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE input_type = 'text') AS text,
                COUNT(*) FILTER (WHERE input_type = 'image') AS image
             FROM compliance_checks
             WHERE organization_id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(ProcessingStats {
            text: row.get("text"),
            image: row.get("image"),
        })
    }

    async fn mark_processing(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE compliance_checks
             SET status = 'processing',
                 started_at = COALESCE(started_at, now()),
                 ocr_status = CASE WHEN input_type = 'image' THEN 'processing' ELSE ocr_status END
             WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return match self.get(id).await? {
                Some(record) => Err(Error::Conflict(format!(
                    "check {} is already {}",
                    id, record.status
                ))),
                None => Err(Error::CheckNotFound(id)),
            };
        }
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid, outcome: &ScanOutcome) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let result = sqlx::query(
            "UPDATE compliance_checks
             SET status = 'completed',
                 extracted_text = COALESCE($2, extracted_text),
                 ocr_status = COALESCE($3, ocr_status),
                 result = $4,
                 error_message = NULL,
                 completed_at = now()
             WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(id)
        .bind(outcome.extracted_text.as_deref())
        .bind(outcome.ocr_status.map(|s| s.as_str()))
        .bind(&outcome.result)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "check {} is not awaiting a result",
                id
            )));
        }

        sqlx::query("DELETE FROM check_violations WHERE check_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for (position, violation) in outcome.violations.iter().enumerate() {
            sqlx::query(
                "INSERT INTO check_violations
                    (check_id, position, category, severity, excerpt, explanation, suggestion)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(id)
            .bind(position as i32)
            .bind(&violation.category)
            .bind(&violation.severity)
            .bind(&violation.excerpt)
            .bind(&violation.explanation)
            .bind(violation.suggestion.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE compliance_checks
             SET status = 'failed',
                 error_message = $2,
                 ocr_status = CASE WHEN ocr_status IN ('pending', 'processing') THEN 'failed' ELSE ocr_status END,
                 completed_at = now()
             WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_unfinished(&self, error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE compliance_checks
             SET status = 'failed', error_message = $1, completed_at = now()
             WHERE status IN ('pending', 'processing')",
        )
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }
}
