//! Repository backing the dispatch queue.
//!
//! A PostgreSQL-backed job queue with unique job ids, delayed execution,
//! and `FOR UPDATE SKIP LOCKED` claiming for lock-free distribution
//! across workers. The job id equals the scheduled send's idempotency
//! key, so enqueues are idempotent and duplicates collapse here as well
//! as in the schedule store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{NewQueueJob, QueueJob},
};

const JOB_COLUMNS: &str = "id, recipient_id, scheduled_for, trace_id, run_at, attempts_made, \
     status, last_error, created_at, updated_at";

/// Repository for dispatch-queue operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Enqueues a job unless one with the same id is already queued,
    /// active, or failed.
    ///
    /// Returns `true` when a new job was inserted, `false` on the
    /// duplicate no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(&self, job: &NewQueueJob) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO queue_jobs (
                id, recipient_id, scheduled_for, trace_id, run_at,
                attempts_made, status, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, 0, 'queued', NOW(), NOW())
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(&job.id)
        .bind(job.recipient_id)
        .bind(job.scheduled_for)
        .bind(job.trace_id)
        .bind(job.run_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Whether a job with this id is currently queued or active.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM queue_jobs WHERE id = $1 AND status IN ('queued', 'active'))",
        )
        .bind(id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(exists)
    }

    /// Removes a job that has not been picked up yet.
    ///
    /// Active jobs are left alone: the worker already owns them, and the
    /// planner's remove-before-mutate ordering accepts that window.
    /// Returns `true` when a queued job was deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn remove_queued(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE id = $1 AND status = 'queued'")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Claims due jobs for processing.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers claim
    /// disjoint jobs without blocking each other. Claimed jobs move to
    /// `active` and their attempt counter is incremented.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(&self, batch_size: usize, now: DateTime<Utc>) -> Result<Vec<QueueJob>> {
        let mut tx = self.pool.begin().await?;

        let job_ids: Vec<String> = sqlx::query_scalar(
            r"
            SELECT id FROM queue_jobs
            WHERE status = 'queued' AND run_at <= $1
            ORDER BY run_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(100))
        .fetch_all(&mut *tx)
        .await?;

        if job_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let jobs = sqlx::query_as::<_, QueueJob>(&format!(
            r"
            UPDATE queue_jobs
            SET status = 'active', attempts_made = attempts_made + 1, updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING {JOB_COLUMNS}
            ",
        ))
        .bind(&job_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(jobs)
    }

    /// Acknowledges a job as done and deletes it.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn complete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = $1").bind(id).execute(&*self.pool).await?;

        Ok(())
    }

    /// Releases an active job back to the queue for a later attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_for_retry(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE queue_jobs
            SET status = 'queued', run_at = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            ",
        )
        .bind(id)
        .bind(run_at)
        .bind(last_error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a job as terminally failed, retaining it for inspection.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(&self, id: &str, last_error: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE queue_jobs
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(last_error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns active jobs that stopped making progress to the queue.
    ///
    /// A job stays `active` forever if its worker dies mid-delivery;
    /// requeueing after a stale window restores at-least-once delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_stale_active(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE queue_jobs
            SET status = 'queued', run_at = NOW(), updated_at = NOW()
            WHERE status = 'active' AND updated_at < $1
            ",
        )
        .bind(stale_before)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes failed jobs older than the retention cutoff.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn purge_failed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM queue_jobs WHERE status = 'failed' AND updated_at < $1")
                .bind(older_than)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}
