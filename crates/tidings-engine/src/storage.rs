//! Storage abstraction for the delivery engine.
//!
//! Trait-based facade over the repositories so the planner, sweeper, and
//! workers can be exercised against an in-memory double. Production uses
//! `PostgresEngineStorage`, which delegates to the concrete
//! `tidings_core::storage::Storage`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tidings_core::{
    error::Result,
    models::{
        NewQueueJob, NewScheduledSend, QueueJob, Recipient, RecipientId, ScheduledSend, SendId,
        SendStatus,
    },
};

/// Storage operations required by the delivery engine.
///
/// Mirrors the repository surface the engine consumes: the schedule
/// store, the read-only recipient adapter, and the dispatch queue.
#[async_trait]
pub trait EngineStorage: Send + Sync + 'static {
    /// Inserts a scheduled send or returns the existing row on key
    /// conflict.
    async fn create_send_if_absent(&self, send: NewScheduledSend) -> Result<ScheduledSend>;

    /// Finds a scheduled send by idempotency key.
    async fn find_send_by_key(&self, key: &str) -> Result<Option<ScheduledSend>>;

    /// Returns pending sends for one local calendar date.
    async fn find_pending_for_local_date(&self, date: NaiveDate) -> Result<Vec<ScheduledSend>>;

    /// Returns sends that should already have been dispatched; used for
    /// downtime recovery.
    async fn find_due_sends(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Vec<ScheduledSend>>;

    /// Applies a status transition under the state-machine rules.
    async fn transition_send(
        &self,
        id: SendId,
        status: SendStatus,
        error_message: Option<String>,
    ) -> Result<ScheduledSend>;

    /// Rewrites the schedule of a not-yet-dispatched send.
    async fn update_send_schedule(
        &self,
        id: SendId,
        scheduled_date: NaiveDate,
        scheduled_for: DateTime<Utc>,
    ) -> Result<ScheduledSend>;

    /// Finds a recipient by id, including soft-deleted rows.
    async fn find_recipient(&self, id: RecipientId) -> Result<Option<Recipient>>;

    /// Returns one keyset page of live recipients.
    async fn list_live_recipients(
        &self,
        after: Option<RecipientId>,
        limit: i64,
    ) -> Result<Vec<Recipient>>;

    /// Enqueues a dispatch job; `false` on the duplicate no-op.
    async fn enqueue_job(&self, job: NewQueueJob) -> Result<bool>;

    /// Whether a job with this id is queued or active.
    async fn job_exists(&self, id: &str) -> Result<bool>;

    /// Removes a queued (not yet claimed) job; `false` when nothing was
    /// removed.
    async fn remove_queued_job(&self, id: &str) -> Result<bool>;

    /// Claims due jobs for processing, incrementing their attempt
    /// counter.
    async fn claim_due_jobs(&self, batch_size: usize, now: DateTime<Utc>)
        -> Result<Vec<QueueJob>>;

    /// Acknowledges a job as done and deletes it.
    async fn complete_job(&self, id: &str) -> Result<()>;

    /// Releases an active job back to the queue for a later attempt.
    async fn release_job_for_retry(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()>;

    /// Marks a job as terminally failed, retaining it for inspection.
    async fn fail_job(&self, id: &str, last_error: &str) -> Result<()>;

    /// Requeues active jobs that stopped making progress.
    async fn requeue_stale_jobs(&self, stale_before: DateTime<Utc>) -> Result<u64>;

    /// Deletes failed jobs past the retention window.
    async fn purge_failed_jobs(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Production storage implementation over PostgreSQL.
pub struct PostgresEngineStorage {
    storage: Arc<tidings_core::storage::Storage>,
}

impl PostgresEngineStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<tidings_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl EngineStorage for PostgresEngineStorage {
    async fn create_send_if_absent(&self, send: NewScheduledSend) -> Result<ScheduledSend> {
        self.storage.scheduled_sends.create_if_absent(&send).await
    }

    async fn find_send_by_key(&self, key: &str) -> Result<Option<ScheduledSend>> {
        self.storage.scheduled_sends.find_by_key(key).await
    }

    async fn find_pending_for_local_date(&self, date: NaiveDate) -> Result<Vec<ScheduledSend>> {
        self.storage.scheduled_sends.find_pending_for_local_date(date).await
    }

    async fn find_due_sends(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<Vec<ScheduledSend>> {
        self.storage.scheduled_sends.find_due(cutoff, max_attempts).await
    }

    async fn transition_send(
        &self,
        id: SendId,
        status: SendStatus,
        error_message: Option<String>,
    ) -> Result<ScheduledSend> {
        self.storage.scheduled_sends.transition(id, status, error_message.as_deref()).await
    }

    async fn update_send_schedule(
        &self,
        id: SendId,
        scheduled_date: NaiveDate,
        scheduled_for: DateTime<Utc>,
    ) -> Result<ScheduledSend> {
        self.storage.scheduled_sends.update_schedule(id, scheduled_date, scheduled_for).await
    }

    async fn find_recipient(&self, id: RecipientId) -> Result<Option<Recipient>> {
        self.storage.recipients.find_by_id(id).await
    }

    async fn list_live_recipients(
        &self,
        after: Option<RecipientId>,
        limit: i64,
    ) -> Result<Vec<Recipient>> {
        self.storage.recipients.list_live(after, limit).await
    }

    async fn enqueue_job(&self, job: NewQueueJob) -> Result<bool> {
        self.storage.queue_jobs.enqueue(&job).await
    }

    async fn job_exists(&self, id: &str) -> Result<bool> {
        self.storage.queue_jobs.exists(id).await
    }

    async fn remove_queued_job(&self, id: &str) -> Result<bool> {
        self.storage.queue_jobs.remove_queued(id).await
    }

    async fn claim_due_jobs(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueJob>> {
        self.storage.queue_jobs.claim_due(batch_size, now).await
    }

    async fn complete_job(&self, id: &str) -> Result<()> {
        self.storage.queue_jobs.complete(id).await
    }

    async fn release_job_for_retry(
        &self,
        id: &str,
        run_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        self.storage.queue_jobs.release_for_retry(id, run_at, last_error).await
    }

    async fn fail_job(&self, id: &str, last_error: &str) -> Result<()> {
        self.storage.queue_jobs.mark_failed(id, last_error).await
    }

    async fn requeue_stale_jobs(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        self.storage.queue_jobs.requeue_stale_active(stale_before).await
    }

    async fn purge_failed_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.storage.queue_jobs.purge_failed(older_than).await
    }
}

pub mod mock {
    //! In-memory storage double for engine tests.
    //!
    //! Reproduces the repository semantics that matter to the engine:
    //! idempotency-key collapse, the status state machine with its
    //! attempt accounting, unique queued jobs, and claim-time attempt
    //! increments. No database required.

    use std::collections::HashMap;

    use tidings_core::{error::CoreError, models::JobStatus};
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::{
        async_trait, DateTime, EngineStorage, NaiveDate, NewQueueJob, NewScheduledSend, QueueJob,
        Recipient, RecipientId, Result, ScheduledSend, SendId, SendStatus, Utc,
    };

    /// In-memory engine storage for tests.
    #[derive(Default)]
    pub struct MockEngineStorage {
        sends: RwLock<HashMap<String, ScheduledSend>>,
        recipients: RwLock<HashMap<RecipientId, Recipient>>,
        jobs: RwLock<HashMap<String, QueueJob>>,
    }

    impl MockEngineStorage {
        /// Creates empty mock storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a recipient.
        pub async fn insert_recipient(&self, recipient: Recipient) {
            self.recipients.write().await.insert(recipient.id, recipient);
        }

        /// Inserts a stored send directly, bypassing `create_if_absent`.
        pub async fn insert_send(&self, send: ScheduledSend) {
            self.sends.write().await.insert(send.idempotency_key.clone(), send);
        }

        /// Snapshot of a send by key.
        pub async fn send_by_key(&self, key: &str) -> Option<ScheduledSend> {
            self.sends.read().await.get(key).cloned()
        }

        /// Snapshot of all sends.
        pub async fn all_sends(&self) -> Vec<ScheduledSend> {
            self.sends.read().await.values().cloned().collect()
        }

        /// Snapshot of a job by id.
        pub async fn job(&self, id: &str) -> Option<QueueJob> {
            self.jobs.read().await.get(id).cloned()
        }

        /// Snapshot of all jobs.
        pub async fn all_jobs(&self) -> Vec<QueueJob> {
            self.jobs.read().await.values().cloned().collect()
        }
    }

    #[async_trait]
    impl EngineStorage for MockEngineStorage {
        async fn create_send_if_absent(&self, send: NewScheduledSend) -> Result<ScheduledSend> {
            let key = send.idempotency_key();
            let mut sends = self.sends.write().await;

            if let Some(existing) = sends.get(&key) {
                return Ok(existing.clone());
            }

            let record = ScheduledSend {
                id: SendId::new(),
                recipient_id: send.recipient_id,
                message_type: send.message_type,
                scheduled_date: send.scheduled_date,
                scheduled_for: send.scheduled_for,
                idempotency_key: key.clone(),
                status: send.status,
                attempt_count: 0,
                last_attempt_at: None,
                sent_at: None,
                error_message: send.error_message,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            sends.insert(key, record.clone());
            Ok(record)
        }

        async fn find_send_by_key(&self, key: &str) -> Result<Option<ScheduledSend>> {
            Ok(self.sends.read().await.get(key).cloned())
        }

        async fn find_pending_for_local_date(
            &self,
            date: NaiveDate,
        ) -> Result<Vec<ScheduledSend>> {
            Ok(self
                .sends
                .read()
                .await
                .values()
                .filter(|s| s.status == SendStatus::Pending && s.scheduled_date == date)
                .cloned()
                .collect())
        }

        async fn find_due_sends(
            &self,
            cutoff: DateTime<Utc>,
            max_attempts: i32,
        ) -> Result<Vec<ScheduledSend>> {
            Ok(self
                .sends
                .read()
                .await
                .values()
                .filter(|s| {
                    s.scheduled_for <= cutoff
                        && (matches!(s.status, SendStatus::Pending | SendStatus::Retrying)
                            || (s.status == SendStatus::Failed && s.attempt_count < max_attempts))
                })
                .cloned()
                .collect())
        }

        async fn transition_send(
            &self,
            id: SendId,
            status: SendStatus,
            error_message: Option<String>,
        ) -> Result<ScheduledSend> {
            let mut sends = self.sends.write().await;
            let record = sends
                .values_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| CoreError::not_found(format!("scheduled send {id} not found")))?;

            if !record.status.can_transition_to(status) {
                return Err(CoreError::InvalidTransition { from: record.status, to: status });
            }

            record.status = status;
            record.updated_at = Utc::now();
            match status {
                SendStatus::Processing => {
                    record.attempt_count += 1;
                    record.last_attempt_at = Some(Utc::now());
                },
                SendStatus::Sent => {
                    record.sent_at = Some(Utc::now());
                    record.error_message = None;
                },
                _ => {
                    if error_message.is_some() {
                        record.error_message = error_message;
                    }
                },
            }
            Ok(record.clone())
        }

        async fn update_send_schedule(
            &self,
            id: SendId,
            scheduled_date: NaiveDate,
            scheduled_for: DateTime<Utc>,
        ) -> Result<ScheduledSend> {
            let mut sends = self.sends.write().await;
            let record = sends
                .values_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| CoreError::not_found(format!("scheduled send {id} not found")))?;

            if !matches!(record.status, SendStatus::Unprocessed | SendStatus::Pending) {
                return Err(CoreError::conflict(format!(
                    "schedule of send {id} cannot change while {}",
                    record.status
                )));
            }

            record.scheduled_date = scheduled_date;
            record.scheduled_for = scheduled_for;
            record.updated_at = Utc::now();
            Ok(record.clone())
        }

        async fn find_recipient(&self, id: RecipientId) -> Result<Option<Recipient>> {
            Ok(self.recipients.read().await.get(&id).cloned())
        }

        async fn list_live_recipients(
            &self,
            after: Option<RecipientId>,
            limit: i64,
        ) -> Result<Vec<Recipient>> {
            let mut live: Vec<Recipient> = self
                .recipients
                .read()
                .await
                .values()
                .filter(|r| r.deleted_at.is_none())
                .filter(|r| after.is_none_or(|cursor| r.id.0 > cursor.0))
                .cloned()
                .collect();
            live.sort_by_key(|r| r.id.0);
            live.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(live)
        }

        async fn enqueue_job(&self, job: NewQueueJob) -> Result<bool> {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job.id) {
                return Ok(false);
            }

            jobs.insert(
                job.id.clone(),
                QueueJob {
                    id: job.id.clone(),
                    recipient_id: job.recipient_id,
                    scheduled_for: job.scheduled_for,
                    trace_id: job.trace_id,
                    run_at: job.run_at,
                    attempts_made: 0,
                    status: JobStatus::Queued,
                    last_error: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
            );
            Ok(true)
        }

        async fn job_exists(&self, id: &str) -> Result<bool> {
            Ok(self
                .jobs
                .read()
                .await
                .get(id)
                .is_some_and(|j| matches!(j.status, JobStatus::Queued | JobStatus::Active)))
        }

        async fn remove_queued_job(&self, id: &str) -> Result<bool> {
            let mut jobs = self.jobs.write().await;
            if jobs.get(id).is_some_and(|j| j.status == JobStatus::Queued) {
                jobs.remove(id);
                return Ok(true);
            }
            Ok(false)
        }

        async fn claim_due_jobs(
            &self,
            batch_size: usize,
            now: DateTime<Utc>,
        ) -> Result<Vec<QueueJob>> {
            let mut jobs = self.jobs.write().await;
            let mut due_ids: Vec<String> = jobs
                .values()
                .filter(|j| j.status == JobStatus::Queued && j.run_at <= now)
                .map(|j| j.id.clone())
                .collect();
            due_ids.sort();
            due_ids.truncate(batch_size);

            let mut claimed = Vec::with_capacity(due_ids.len());
            for id in due_ids {
                if let Some(job) = jobs.get_mut(&id) {
                    job.status = JobStatus::Active;
                    job.attempts_made += 1;
                    job.updated_at = Utc::now();
                    claimed.push(job.clone());
                }
            }
            Ok(claimed)
        }

        async fn complete_job(&self, id: &str) -> Result<()> {
            self.jobs.write().await.remove(id);
            Ok(())
        }

        async fn release_job_for_retry(
            &self,
            id: &str,
            run_at: DateTime<Utc>,
            last_error: &str,
        ) -> Result<()> {
            if let Some(job) = self.jobs.write().await.get_mut(id) {
                if job.status == JobStatus::Active {
                    job.status = JobStatus::Queued;
                    job.run_at = run_at;
                    job.last_error = Some(last_error.to_string());
                    job.updated_at = Utc::now();
                }
            }
            Ok(())
        }

        async fn fail_job(&self, id: &str, last_error: &str) -> Result<()> {
            if let Some(job) = self.jobs.write().await.get_mut(id) {
                job.status = JobStatus::Failed;
                job.last_error = Some(last_error.to_string());
                job.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn requeue_stale_jobs(&self, stale_before: DateTime<Utc>) -> Result<u64> {
            let mut jobs = self.jobs.write().await;
            let mut requeued = 0;
            for job in jobs.values_mut() {
                if job.status == JobStatus::Active && job.updated_at < stale_before {
                    job.status = JobStatus::Queued;
                    job.run_at = Utc::now();
                    job.updated_at = Utc::now();
                    requeued += 1;
                }
            }
            Ok(requeued)
        }

        async fn purge_failed_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
            let mut jobs = self.jobs.write().await;
            let before = jobs.len();
            jobs.retain(|_, j| !(j.status == JobStatus::Failed && j.updated_at < older_than));
            Ok(u64::try_from(before - jobs.len()).unwrap_or(0))
        }
    }

    /// Convenience constructor for a job due immediately.
    pub fn due_job(id: &str, recipient_id: RecipientId, now: DateTime<Utc>) -> NewQueueJob {
        NewQueueJob {
            id: id.to_string(),
            recipient_id,
            scheduled_for: now,
            trace_id: Uuid::new_v4(),
            run_at: now,
        }
    }
}
