//! Database access layer implementing the repository pattern.
//!
//! The repository layer acts as an anti-corruption layer, translating
//! between domain models and database schemas. All database operations
//! MUST go through these repositories; direct SQL elsewhere is forbidden
//! to keep the state-machine and idempotency guarantees in one place.

use std::sync::Arc;

use sqlx::PgPool;

pub mod queue_jobs;
pub mod recipients;
pub mod scheduled_sends;

use crate::error::Result;

/// Container for all repository instances providing unified database
/// access.
///
/// The entry point for all database operations in Tidings. Manages a
/// shared connection pool and provides type-safe access to each domain
/// repository.
#[derive(Clone)]
pub struct Storage {
    /// Repository for scheduled-send records (the Schedule Store).
    pub scheduled_sends: Arc<scheduled_sends::Repository>,

    /// Read-only adapter over the recipient table.
    pub recipients: Arc<recipients::Repository>,

    /// Repository backing the dispatch queue.
    pub queue_jobs: Arc<queue_jobs::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            scheduled_sends: Arc::new(scheduled_sends::Repository::new(pool.clone())),
            recipients: Arc::new(recipients::Repository::new(pool.clone())),
            queue_jobs: Arc::new(queue_jobs::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy or
    /// the query times out.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) =
            sqlx::query_as("SELECT 1").fetch_one(&*self.scheduled_sends.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        // Instantiation only; database behaviour is covered by the
        // engine's mock-storage and integration tests.
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
