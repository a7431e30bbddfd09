//! Delivery workers and the engine that supervises them.
//!
//! Workers claim due jobs from the dispatch queue, walk each scheduled
//! send through the status state machine, and invoke the external
//! endpoint through the shared circuit breaker. The classification of
//! the outcome (2xx commit, 4xx terminal, 5xx/timeout/circuit-open
//! retried with backoff) lives here and nowhere else.

use std::{sync::Arc, time::Duration};

use tidings_core::{
    error::CoreError,
    models::{QueueJob, Recipient, ScheduledSend, SendStatus},
    Clock,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    circuit::{CircuitBreaker, CircuitConfig},
    client::{ClientConfig, EmailClient, SendOutcome},
    error::{EngineError, Result},
    retry::RetryPolicy,
    storage::EngineStorage,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub concurrency: usize,

    /// Maximum jobs to claim per worker batch.
    pub batch_size: usize,

    /// How often idle workers poll the queue.
    pub poll_interval: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Circuit breaker configuration.
    pub circuit_config: CircuitConfig,

    /// Retry policy applied to retriable failures.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for workers during graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::DEFAULT_CONCURRENCY,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            client_config: ClientConfig::default(),
            circuit_config: CircuitConfig::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Total jobs processed since startup.
    pub jobs_processed: u64,
    /// Sends committed as delivered.
    pub sends_delivered: u64,
    /// Attempts that were released for retry.
    pub sends_retried: u64,
    /// Sends finalised as failed.
    pub sends_failed: u64,
    /// Jobs currently being delivered.
    pub in_flight: u64,
}

/// Main engine coordinating the delivery worker pool.
pub struct DeliveryEngine {
    storage: Arc<dyn EngineStorage>,
    config: DeliveryConfig,
    client: Arc<EmailClient>,
    circuit: Arc<CircuitBreaker>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates a new delivery engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be initialised.
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Arc::new(EmailClient::new(config.client_config.clone())?);
        let circuit = Arc::new(CircuitBreaker::new(config.circuit_config.clone()));
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let cancellation_token = CancellationToken::new();

        Ok(Self {
            storage,
            config,
            client,
            circuit,
            stats,
            cancellation_token,
            worker_pool: None,
            clock,
        })
    }

    /// Starts the configured worker pool.
    ///
    /// Returns immediately after spawning workers; use `shutdown` to
    /// stop gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            "starting delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.storage.clone(),
            self.config.clone(),
            self.client.clone(),
            self.circuit.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Gracefully shuts down the engine, letting in-flight deliveries
    /// finish within the shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns error if shutdown times out or workers fail to join.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was never started, nothing to stop");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }
}

/// Individual worker that processes dispatch jobs.
pub struct DeliveryWorker {
    id: usize,
    storage: Arc<dyn EngineStorage>,
    config: DeliveryConfig,
    client: Arc<EmailClient>,
    circuit: Arc<CircuitBreaker>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        storage: Arc<dyn EngineStorage>,
        config: DeliveryConfig,
        client: Arc<EmailClient>,
        circuit: Arc<CircuitBreaker>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, config, client, circuit, stats, cancellation_token, clock }
    }

    /// Main worker loop; claims and processes jobs until cancelled.
    ///
    /// # Errors
    ///
    /// Returns error only on setup failures. Per-batch errors are logged
    /// and retried after a pause.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(err) => {
                    error!(worker_id = self.id, error = %err, "batch processing failed");
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims and processes one batch of due jobs.
    async fn process_batch(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let jobs = self.storage.claim_due_jobs(self.config.batch_size, now).await?;
        let batch_size = jobs.len();

        debug!(worker_id = self.id, batch_size, "processing job batch");

        for job in jobs {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            {
                let mut stats = self.stats.write().await;
                stats.in_flight += 1;
            }

            let result = self.process_job(&job).await;

            {
                let mut stats = self.stats.write().await;
                stats.in_flight -= 1;
                stats.jobs_processed += 1;
            }

            if let Err(err) = result {
                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    trace_id = %job.trace_id,
                    error = %err,
                    "job processing failed"
                );
            }
        }

        Ok(batch_size)
    }

    /// Processes a single dispatch job through the delivery pipeline.
    ///
    /// # Errors
    ///
    /// Returns error when a storage operation fails mid-pipeline; the
    /// job stays active and the stale-job requeue recovers it.
    pub async fn process_job(&self, job: &QueueJob) -> Result<()> {
        // 1. The job id is the scheduled send's idempotency key.
        let Some(send) = self.storage.find_send_by_key(&job.id).await? else {
            error!(
                worker_id = self.id,
                job_id = %job.id,
                trace_id = %job.trace_id,
                "no scheduled send for job, dropping"
            );
            self.storage.fail_job(&job.id, "no scheduled send for job id").await?;
            return Ok(());
        };

        // 2. Duplicate-job guard: already delivered means acknowledge
        // and walk away.
        if send.status == SendStatus::Sent {
            debug!(worker_id = self.id, job_id = %job.id, "send already delivered, acknowledging");
            self.storage.complete_job(&job.id).await?;
            return Ok(());
        }

        // 3. Claim the record. A record cancelled underneath the job
        // (birthdate edit race) rejects the transition; the job is
        // obsolete, not an error. A record still in processing after a
        // worker crash resumes without a second transition.
        let send = if send.status == SendStatus::Processing {
            warn!(
                worker_id = self.id,
                job_id = %job.id,
                "resuming send left in processing by an interrupted worker"
            );
            send
        } else {
            match self.storage.transition_send(send.id, SendStatus::Processing, None).await {
                Ok(send) => send,
                Err(CoreError::InvalidTransition { from, to }) => {
                    warn!(
                        worker_id = self.id,
                        job_id = %job.id,
                        %from,
                        %to,
                        "send no longer eligible, dropping obsolete job"
                    );
                    self.storage.complete_job(&job.id).await?;
                    return Ok(());
                },
                Err(err) => return Err(err.into()),
            }
        };

        // 4. Re-check the recipient at dispatch time.
        let recipient = self.storage.find_recipient(send.recipient_id).await?;
        let Some(recipient) = recipient.filter(|r| !r.is_deleted()) else {
            warn!(
                worker_id = self.id,
                job_id = %job.id,
                recipient_id = %send.recipient_id,
                "recipient unavailable, finalising send as failed"
            );
            self.storage
                .transition_send(send.id, SendStatus::Failed, Some("recipient unavailable".into()))
                .await?;
            self.storage.complete_job(&job.id).await?;
            return Ok(());
        };

        // 5 + 6. Render and deliver through the circuit breaker.
        let outcome = self.deliver(&recipient, job).await;
        self.settle(&send, job, outcome).await
    }

    /// Invokes the endpoint unless the circuit breaker is open, feeding
    /// the outcome back into the breaker.
    async fn deliver(&self, recipient: &Recipient, job: &QueueJob) -> Result<SendOutcome> {
        if !self.circuit.should_allow_request().await {
            return Err(EngineError::CircuitOpen);
        }

        let message = render_birthday_message(recipient);
        let result = self.client.send(&recipient.email, &message, job.trace_id).await;

        match &result {
            Ok(outcome) if outcome.is_success => self.circuit.record_success().await,
            Ok(_) | Err(_) => self.circuit.record_failure().await,
        }

        result
    }

    /// Commits the terminal or retrying state for one attempt.
    async fn settle(
        &self,
        send: &ScheduledSend,
        job: &QueueJob,
        outcome: Result<SendOutcome>,
    ) -> Result<()> {
        match outcome {
            Ok(response) if response.is_success => {
                self.storage.transition_send(send.id, SendStatus::Sent, None).await?;
                self.storage.complete_job(&job.id).await?;

                let mut stats = self.stats.write().await;
                stats.sends_delivered += 1;

                info!(
                    worker_id = self.id,
                    job_id = %job.id,
                    trace_id = %job.trace_id,
                    status = response.status_code,
                    duration_ms = response.duration.as_millis(),
                    "birthday message delivered"
                );
                Ok(())
            },

            Ok(response) if (400..500).contains(&response.status_code) => {
                // Permanent failure: the record keeps the error detail,
                // the job is acknowledged so the queue stops retrying.
                let detail = format!("HTTP {}: {}", response.status_code, response.body);
                self.finalise_failed(send, job, &detail, JobDisposition::Acknowledge).await?;

                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    trace_id = %job.trace_id,
                    status = response.status_code,
                    "permanent delivery failure"
                );
                Ok(())
            },

            Ok(response) => {
                let detail = format!("HTTP {}: {}", response.status_code, response.body);
                self.retry_or_fail(send, job, &detail).await
            },

            Err(err) if err.is_retryable() => {
                let detail = err.to_string();
                self.retry_or_fail(send, job, &detail).await
            },

            Err(err) => {
                self.finalise_failed(send, job, &err.to_string(), JobDisposition::Acknowledge)
                    .await?;

                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    trace_id = %job.trace_id,
                    error = %err,
                    "non-retriable delivery error"
                );
                Ok(())
            },
        }
    }

    /// Either schedules the next attempt with backoff or finalises the
    /// send once the attempt budget is spent.
    async fn retry_or_fail(&self, send: &ScheduledSend, job: &QueueJob, detail: &str) -> Result<()> {
        let attempts_made = u32::try_from(job.attempts_made).unwrap_or(u32::MAX);

        if self.config.retry_policy.attempts_exhausted(attempts_made) {
            self.finalise_failed(send, job, detail, JobDisposition::Retain).await?;

            error!(
                worker_id = self.id,
                job_id = %job.id,
                trace_id = %job.trace_id,
                attempts_made,
                detail,
                "retries exhausted, send failed"
            );
            return Ok(());
        }

        let delay = self.config.retry_policy.delay_after_attempt(attempts_made);
        let run_at = self.clock.now_utc()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(2));

        self.storage
            .transition_send(send.id, SendStatus::Retrying, Some(detail.to_string()))
            .await?;
        self.storage.release_job_for_retry(&job.id, run_at, detail).await?;

        {
            let mut stats = self.stats.write().await;
            stats.sends_retried += 1;
        }

        warn!(
            worker_id = self.id,
            job_id = %job.id,
            trace_id = %job.trace_id,
            attempts_made,
            next_attempt_at = %run_at,
            detail,
            "delivery failed, retry scheduled"
        );
        Ok(())
    }

    async fn finalise_failed(
        &self,
        send: &ScheduledSend,
        job: &QueueJob,
        detail: &str,
        disposition: JobDisposition,
    ) -> Result<()> {
        self.storage
            .transition_send(send.id, SendStatus::Failed, Some(detail.to_string()))
            .await?;
        match disposition {
            JobDisposition::Acknowledge => self.storage.complete_job(&job.id).await?,
            JobDisposition::Retain => self.storage.fail_job(&job.id, detail).await?,
        }

        let mut stats = self.stats.write().await;
        stats.sends_failed += 1;
        Ok(())
    }
}

/// What happens to the queue job once its send is finalised as failed.
#[derive(Debug, Clone, Copy)]
enum JobDisposition {
    /// Permanent failures acknowledge the job; nothing to inspect that
    /// the record does not already carry.
    Acknowledge,
    /// Exhausted retries keep the job around for inspection until the
    /// retention purge.
    Retain,
}

/// Renders the greeting body for a recipient.
///
/// The wording is part of the external contract; change it only together
/// with the endpoint's consumers.
pub fn render_birthday_message(recipient: &Recipient) -> String {
    format!("Hey, {} it's your birthday", recipient.full_name())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tidings_core::models::RecipientId;

    use super::*;

    #[test]
    fn message_body_matches_contract() {
        let recipient = Recipient {
            id: RecipientId::new(),
            first_name: "John".to_string(),
            last_name: "Doe".to_string(),
            email: "john@x".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1990, 1, 15).unwrap(),
            timezone: "America/New_York".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        };

        assert_eq!(render_birthday_message(&recipient), "Hey, John Doe it's your birthday");
    }
}
