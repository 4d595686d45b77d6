//! Organization quota lookup.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use regula_core::{Error, OrganizationQuota, QuotaRepository, Result};

/// PostgreSQL implementation of QuotaRepository.
///
/// Usage is the number of checks created since the start of the current
/// calendar month (server time zone).
#[derive(Clone)]
pub struct PgQuotaRepository {
    pool: Pool<Postgres>,
}

impl PgQuotaRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaRepository for PgQuotaRepository {
    async fn quota(&self, organization_id: Uuid) -> Result<OrganizationQuota> {
        let row = sqlx::query(
            "SELECT o.monthly_check_limit,
                    (SELECT COUNT(*) FROM compliance_checks c
                     WHERE c.organization_id = o.id
                       AND c.created_at >= date_trunc('month', now())) AS current_month_checks
             FROM organizations o
             WHERE o.id = $1",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::NotFound(format!("organization {}", organization_id)))?;

        Ok(OrganizationQuota {
            organization_id,
            monthly_limit: row.get("monthly_check_limit"),
            current_month_checks: row.get("current_month_checks"),
        })
    }
}
