//! Dictionary entries and their pgvector embeddings.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use regula_core::{DictionaryEntry, DictionaryRepository, Error, Result};

/// PostgreSQL implementation of DictionaryRepository.
#[derive(Clone)]
pub struct PgDictionaryRepository {
    pool: Pool<Postgres>,
}

impl PgDictionaryRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DictionaryRepository for PgDictionaryRepository {
    async fn list_ids(&self, organization_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM dictionary_entries WHERE organization_id = $1 ORDER BY id",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DictionaryEntry>> {
        let row = sqlx::query(
            "SELECT id, organization_id, phrase FROM dictionary_entries WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| DictionaryEntry {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            phrase: row.get("phrase"),
        }))
    }

    async fn store_embedding(&self, id: Uuid, vector: Vector, model: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dictionary_entries
             SET embedding = $2, embedding_model = $3, embedded_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(&vector)
        .bind(model)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("dictionary entry {}", id)));
        }
        Ok(())
    }
}
