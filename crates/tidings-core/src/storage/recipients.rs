//! Read-only adapter over the recipient table.
//!
//! Recipient writes happen in the external CRUD surface, which emits
//! event-bus events after commit. The engine only queries: lookups at
//! dispatch time and a keyset scan for the hourly sweep.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Recipient, RecipientId},
};

const RECIPIENT_COLUMNS: &str =
    "id, first_name, last_name, email, birth_date, timezone, created_at, updated_at, deleted_at";

/// Read-only repository for recipient lookups.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a recipient by id, including soft-deleted rows.
    ///
    /// Callers check `deleted_at` themselves; the worker needs to see
    /// deleted recipients to finalise their pending sends.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: RecipientId) -> Result<Option<Recipient>> {
        let recipient = sqlx::query_as::<_, Recipient>(&format!(
            "SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(recipient)
    }

    /// Returns one page of live (not soft-deleted) recipients.
    ///
    /// Keyset pagination over the id keeps the hourly sweep bounded on
    /// large recipient sets; pass the last id of the previous page to
    /// continue.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_live(
        &self,
        after: Option<RecipientId>,
        limit: i64,
    ) -> Result<Vec<Recipient>> {
        let recipients = sqlx::query_as::<_, Recipient>(&format!(
            r"
            SELECT {RECIPIENT_COLUMNS} FROM recipients
            WHERE deleted_at IS NULL AND ($1::UUID IS NULL OR id > $1)
            ORDER BY id ASC
            LIMIT $2
            ",
        ))
        .bind(after)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(recipients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
