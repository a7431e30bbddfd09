//! Repository for scheduled-send records (the Schedule Store).
//!
//! Enforces the idempotency-key uniqueness and the status state machine.
//! Transitions use conditional updates (`WHERE status = ANY(...)`) so
//! concurrent writers serialise per record without advisory locks; a
//! losing writer gets `InvalidTransition` and the record is unchanged.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{NewScheduledSend, ScheduledSend, SendId, SendStatus},
};

const SEND_COLUMNS: &str = "id, recipient_id, message_type, scheduled_date, scheduled_for, \
     idempotency_key, status, attempt_count, last_attempt_at, sent_at, error_message, \
     created_at, updated_at";

/// Repository for scheduled-send database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a record keyed by its idempotency key, or returns the
    /// existing row unchanged on conflict.
    ///
    /// The uniqueness of the key is enforced by the database constraint,
    /// so concurrent planners and sweepers collapse to a single record.
    ///
    /// # Errors
    ///
    /// Returns error if the insert or the conflict-path fetch fails.
    pub async fn create_if_absent(&self, send: &NewScheduledSend) -> Result<ScheduledSend> {
        let key = send.idempotency_key();

        let inserted = sqlx::query_as::<_, ScheduledSend>(&format!(
            r"
            INSERT INTO scheduled_sends (
                id, recipient_id, message_type, scheduled_date, scheduled_for,
                idempotency_key, status, attempt_count, error_message,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, NOW(), NOW())
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {SEND_COLUMNS}
            ",
        ))
        .bind(SendId::new())
        .bind(send.recipient_id)
        .bind(send.message_type)
        .bind(send.scheduled_date)
        .bind(send.scheduled_for)
        .bind(&key)
        .bind(send.status)
        .bind(&send.error_message)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(record) = inserted {
            return Ok(record);
        }

        self.find_by_key(&key)
            .await?
            .ok_or_else(|| CoreError::database(format!("conflicting row vanished for key {key}")))
    }

    /// Finds a record by its idempotency key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_key(&self, key: &str) -> Result<Option<ScheduledSend>> {
        let record = sqlx::query_as::<_, ScheduledSend>(&format!(
            "SELECT {SEND_COLUMNS} FROM scheduled_sends WHERE idempotency_key = $1",
        ))
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Returns pending records for one local calendar date.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_pending_for_local_date(&self, date: NaiveDate) -> Result<Vec<ScheduledSend>> {
        let records = sqlx::query_as::<_, ScheduledSend>(&format!(
            r"
            SELECT {SEND_COLUMNS} FROM scheduled_sends
            WHERE status = 'pending' AND scheduled_date = $1
            ORDER BY scheduled_for ASC
            ",
        ))
        .bind(date)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Returns records that should already have been dispatched.
    ///
    /// Used by downtime recovery: pending and retrying records whose
    /// instant has passed, plus failed records still under the attempt
    /// ceiling as a restart safety net.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_due(
        &self,
        cutoff_utc: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Vec<ScheduledSend>> {
        let records = sqlx::query_as::<_, ScheduledSend>(&format!(
            r"
            SELECT {SEND_COLUMNS} FROM scheduled_sends
            WHERE scheduled_for <= $1
              AND (status IN ('pending', 'retrying')
                   OR (status = 'failed' AND attempt_count < $2))
            ORDER BY scheduled_for ASC
            ",
        ))
        .bind(cutoff_utc)
        .bind(max_attempts)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Applies a status transition under the state-machine rules.
    ///
    /// Entering `Processing` increments `attempt_count` and stamps
    /// `last_attempt_at`. Entering `Sent` sets `sent_at` and clears
    /// `error_message`. `Failed` and `Retrying` store the supplied
    /// `error_message`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` (record unchanged) when the current
    /// status does not admit the move, `NotFound` when the record does
    /// not exist.
    pub async fn transition(
        &self,
        id: SendId,
        new_status: SendStatus,
        error_message: Option<&str>,
    ) -> Result<ScheduledSend> {
        let allowed: Vec<String> =
            new_status.allowed_sources().iter().map(ToString::to_string).collect();
        if allowed.is_empty() {
            return Err(CoreError::validation(format!(
                "no transition leads to {new_status}"
            )));
        }

        let updated = sqlx::query_as::<_, ScheduledSend>(&format!(
            r"
            UPDATE scheduled_sends
            SET status = $2,
                attempt_count = attempt_count + CASE WHEN $2 = 'processing' THEN 1 ELSE 0 END,
                last_attempt_at = CASE WHEN $2 = 'processing' THEN NOW() ELSE last_attempt_at END,
                sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END,
                error_message = CASE
                    WHEN $2 = 'sent' THEN NULL
                    WHEN $3::TEXT IS NOT NULL THEN $3
                    ELSE error_message
                END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            RETURNING {SEND_COLUMNS}
            ",
        ))
        .bind(id)
        .bind(new_status)
        .bind(error_message)
        .bind(&allowed)
        .fetch_optional(&*self.pool)
        .await?;

        match updated {
            Some(record) => Ok(record),
            None => {
                let current = self.find_status(id).await?;
                Err(CoreError::InvalidTransition { from: current, to: new_status })
            },
        }
    }

    /// Rewrites the schedule of a not-yet-dispatched record.
    ///
    /// Only valid while the record is `Unprocessed` or `Pending`; used
    /// when a timezone change moves the send instant.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the record has already progressed past
    /// the reschedulable statuses, `NotFound` when it does not exist.
    pub async fn update_schedule(
        &self,
        id: SendId,
        scheduled_date: NaiveDate,
        scheduled_for: DateTime<Utc>,
    ) -> Result<ScheduledSend> {
        let updated = sqlx::query_as::<_, ScheduledSend>(&format!(
            r"
            UPDATE scheduled_sends
            SET scheduled_date = $2, scheduled_for = $3, updated_at = NOW()
            WHERE id = $1 AND status IN ('unprocessed', 'pending')
            RETURNING {SEND_COLUMNS}
            ",
        ))
        .bind(id)
        .bind(scheduled_date)
        .bind(scheduled_for)
        .fetch_optional(&*self.pool)
        .await?;

        match updated {
            Some(record) => Ok(record),
            None => {
                let current = self.find_status(id).await?;
                Err(CoreError::conflict(format!(
                    "schedule of send {id} cannot change while {current}"
                )))
            },
        }
    }

    async fn find_status(&self, id: SendId) -> Result<SendStatus> {
        sqlx::query_scalar::<_, SendStatus>("SELECT status FROM scheduled_sends WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("scheduled send {id} not found")))
    }
}
