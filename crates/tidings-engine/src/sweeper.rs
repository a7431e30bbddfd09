//! Hourly sweep coordinator.
//!
//! A single-instance periodic task that runs at minute 0 of every hour
//! (and once immediately on startup, which is what recovers work missed
//! during downtime). Each sweep promotes today's birthdays into pending
//! records, dispatches due records into the queue, and performs queue
//! maintenance. Correctness does not depend on single-instance
//! execution: every operation is keyed by the idempotency key, so
//! duplicate sweeps collapse at the schedule store and the queue.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tidings_core::{
    duration_until_next_hour, idempotency_key, matches_local_birthday,
    models::{MessageType, NewQueueJob, NewScheduledSend, Recipient, ScheduledSend},
    next_occurrence, Clock, SendStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::Result, storage::EngineStorage};

/// Configuration for the hourly sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Local hour of day (0-23) deliveries are scheduled at.
    pub send_hour: u32,
    /// Message types the sweep materialises.
    pub message_types: Vec<MessageType>,
    /// Page size for the live-recipient scan.
    pub recipient_page_size: i64,
    /// Active jobs older than this are considered stalled and requeued.
    pub stale_job_after: std::time::Duration,
    /// Failed jobs are purged after this retention window.
    pub failed_job_retention: std::time::Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            send_hour: 9,
            message_types: MessageType::all().to_vec(),
            recipient_page_size: 500,
            stale_job_after: std::time::Duration::from_secs(10 * 60),
            failed_job_retention: std::time::Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Outcome of one sweep, returned to operators via the manual trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Pending records examined by the dispatch phase.
    pub total: usize,
    /// Records newly enqueued this sweep.
    pub queued: usize,
    /// Records left for a later tick because their instant is ahead.
    pub skipped_not_due: usize,
    /// Records whose job was already queued or active.
    pub skipped_already_queued: usize,
    /// Keys (or recipient ids) that errored during the sweep.
    pub failed_ids: Vec<String>,
}

impl SweepSummary {
    /// Number of failures this sweep.
    pub fn failed(&self) -> usize {
        self.failed_ids.len()
    }
}

/// Periodic coordinator promoting and dispatching due sends.
pub struct HourlySweeper {
    storage: Arc<dyn EngineStorage>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl HourlySweeper {
    /// Creates a sweeper over the given storage and clock.
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self { storage, clock, config }
    }

    /// Runs the sweep loop until cancelled.
    ///
    /// Sweeps once immediately (downtime recovery), then at minute 0 of
    /// every hour.
    pub async fn run(&self, token: CancellationToken) {
        info!("hourly sweeper starting with immediate recovery sweep");

        if let Err(err) = self.sweep(false).await {
            warn!(error = %err, "startup sweep failed");
        }

        loop {
            let wait = duration_until_next_hour(self.clock.now_utc());
            debug!(wait_secs = wait.as_secs(), "sweeper sleeping until next hour");

            tokio::select! {
                () = self.clock.sleep(wait) => {}
                () = token.cancelled() => {
                    info!("hourly sweeper received shutdown signal");
                    return;
                }
            }

            match self.sweep(false).await {
                Ok(summary) => {
                    info!(
                        total = summary.total,
                        queued = summary.queued,
                        skipped_not_due = summary.skipped_not_due,
                        skipped_already_queued = summary.skipped_already_queued,
                        failed = summary.failed(),
                        "hourly sweep completed"
                    );
                },
                Err(err) => warn!(error = %err, "hourly sweep failed"),
            }
        }
    }

    /// Runs one sweep.
    ///
    /// `force` bypasses the `scheduled_for <= now` gate in the dispatch
    /// phase; the manual trigger uses it to push today's records out
    /// regardless of the clock.
    ///
    /// # Errors
    ///
    /// Returns error only when a phase cannot run at all; per-record
    /// failures land in `failed_ids`.
    pub async fn sweep(&self, force: bool) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        self.promote_todays_birthdays(&mut summary).await?;
        self.dispatch_due_records(force, &mut summary).await?;
        self.queue_maintenance().await;

        Ok(summary)
    }

    /// Phase 1: ensure every recipient whose birthday is today in their
    /// zone has a pending record.
    ///
    /// Covers recipients created before the engine existed and records
    /// left `Unprocessed` by the planner. `create_if_absent` makes this
    /// idempotent against the planner and concurrent sweeps.
    async fn promote_todays_birthdays(&self, summary: &mut SweepSummary) -> Result<()> {
        let now = self.clock.now_utc();
        let mut cursor = None;

        loop {
            let page = self
                .storage
                .list_live_recipients(cursor, self.config.recipient_page_size)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.id);

            for recipient in &page {
                if let Err(err) = self.promote_recipient(recipient, now).await {
                    warn!(
                        recipient_id = %recipient.id,
                        error = %err,
                        "failed to promote recipient's birthday record"
                    );
                    summary.failed_ids.push(recipient.id.to_string());
                }
            }
        }

        Ok(())
    }

    async fn promote_recipient(&self, recipient: &Recipient, now: DateTime<Utc>) -> Result<()> {
        let tz = recipient.tz()?;
        if !matches_local_birthday(recipient.birth_date, tz, now) {
            return Ok(());
        }

        for message_type in self.config.message_types.clone() {
            let occurrence = next_occurrence(recipient.birth_date, tz, self.config.send_hour, now)?;

            let record = self
                .storage
                .create_send_if_absent(NewScheduledSend {
                    recipient_id: recipient.id,
                    message_type,
                    scheduled_date: occurrence.local_date,
                    scheduled_for: occurrence.utc_instant,
                    status: SendStatus::Pending,
                    error_message: None,
                })
                .await?;

            if record.status == SendStatus::Unprocessed {
                self.storage.transition_send(record.id, SendStatus::Pending, None).await?;
                debug!(
                    key = %record.idempotency_key,
                    "promoted unprocessed record to pending"
                );
            }
        }
        Ok(())
    }

    /// Phase 2: hand due pending records to the dispatch queue.
    ///
    /// "Today" differs per zone, so the scan covers every local date
    /// that is currently today somewhere on Earth: the UTC date and its
    /// two neighbours.
    async fn dispatch_due_records(&self, force: bool, summary: &mut SweepSummary) -> Result<()> {
        let now = self.clock.now_utc();

        for date in candidate_local_dates(now) {
            let records = self.storage.find_pending_for_local_date(date).await?;
            for record in records {
                summary.total += 1;
                if let Err(err) = self.dispatch_record(&record, force, now, summary).await {
                    warn!(
                        key = %record.idempotency_key,
                        error = %err,
                        "failed to dispatch pending record"
                    );
                    summary.failed_ids.push(record.idempotency_key.clone());
                }
            }
        }

        // Retrying records whose job vanished (crash between the status
        // transition and the queue write) are re-enqueued here so they
        // are not stranded.
        let max_attempts = i32::try_from(crate::DEFAULT_MAX_ATTEMPTS).unwrap_or(5);
        let due = self.storage.find_due_sends(now, max_attempts).await?;
        for record in due.into_iter().filter(|r| r.status == SendStatus::Retrying) {
            if !self.storage.job_exists(&record.idempotency_key).await? {
                let enqueued = self.enqueue_record(&record, now).await?;
                if enqueued {
                    info!(key = %record.idempotency_key, "re-enqueued stranded retrying record");
                }
            }
        }

        Ok(())
    }

    async fn dispatch_record(
        &self,
        record: &ScheduledSend,
        force: bool,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<()> {
        if !force && record.scheduled_for > now {
            summary.skipped_not_due += 1;
            return Ok(());
        }

        if self.storage.job_exists(&record.idempotency_key).await? {
            summary.skipped_already_queued += 1;
            return Ok(());
        }

        if self.enqueue_record(record, now).await? {
            summary.queued += 1;
        } else {
            summary.skipped_already_queued += 1;
        }
        Ok(())
    }

    async fn enqueue_record(&self, record: &ScheduledSend, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .storage
            .enqueue_job(NewQueueJob {
                id: idempotency_key(
                    record.recipient_id,
                    record.message_type,
                    record.scheduled_date,
                ),
                recipient_id: record.recipient_id,
                scheduled_for: record.scheduled_for,
                trace_id: Uuid::new_v4(),
                run_at: now,
            })
            .await?)
    }

    /// Queue housekeeping: requeue stalled claims, purge old failures.
    /// Best-effort; failures are logged and the sweep result stands.
    async fn queue_maintenance(&self) {
        let now = self.clock.now_utc();

        let stale_before = now
            - ChronoDuration::from_std(self.config.stale_job_after)
                .unwrap_or_else(|_| ChronoDuration::minutes(10));
        match self.storage.requeue_stale_jobs(stale_before).await {
            Ok(0) => {},
            Ok(requeued) => info!(requeued, "requeued stalled active jobs"),
            Err(err) => warn!(error = %err, "failed to requeue stalled jobs"),
        }

        let purge_before = now
            - ChronoDuration::from_std(self.config.failed_job_retention)
                .unwrap_or_else(|_| ChronoDuration::days(7));
        match self.storage.purge_failed_jobs(purge_before).await {
            Ok(0) => {},
            Ok(purged) => info!(purged, "purged failed jobs past retention"),
            Err(err) => warn!(error = %err, "failed to purge old failed jobs"),
        }
    }
}

/// Local dates that are "today" in at least one IANA zone at `now`.
///
/// Zone offsets span roughly UTC-12 to UTC+14, so the UTC date and its
/// two neighbours always cover the full set.
fn candidate_local_dates(now: DateTime<Utc>) -> [NaiveDate; 3] {
    let utc_today = now.date_naive();
    [utc_today.pred_opt().unwrap_or(utc_today), utc_today, utc_today.succ_opt().unwrap_or(utc_today)]
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn candidate_dates_bracket_the_utc_date() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap();
        let dates = candidate_local_dates(now);

        assert_eq!(dates[0], NaiveDate::from_ymd_opt(2024, 1, 14).unwrap());
        assert_eq!(dates[1], NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(dates[2], NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());
    }
}
