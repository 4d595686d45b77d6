//! # regula-db
//!
//! Store adapters for regula.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for check records, quotas and dictionary entries
//! - pgvector storage for dictionary embeddings
//! - A `LISTEN`/`NOTIFY` bridge onto the event bus
//! - An in-memory store implementing the same traits
//!
//! ## Example
//!
//! ```rust,ignore
//! use regula_db::{Database, CheckRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/regula").await?;
//!     let record = db.checks.get(check_id).await?;
//!     Ok(())
//! }
//! ```
pub mod checks;
pub mod dictionary;
pub mod listener;
pub mod memory;
pub mod pool;
pub mod quotas;

// Re-export core types
pub use regula_core::*;

pub use checks::PgCheckRepository;
pub use dictionary::PgDictionaryRepository;
pub use listener::listen_for_check_updates;
pub use memory::MemoryStore;
pub use pool::{create_pool_with_config, PoolConfig};
pub use quotas::PgQuotaRepository;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Compliance check records and their violations.
    pub checks: PgCheckRepository,
    /// Organization monthly allowances.
    pub quotas: PgQuotaRepository,
    /// Dictionary entries and embeddings.
    pub dictionary: PgDictionaryRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            checks: PgCheckRepository::new(pool.clone()),
            quotas: PgQuotaRepository::new(pool.clone()),
            dictionary: PgDictionaryRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::from_env()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
