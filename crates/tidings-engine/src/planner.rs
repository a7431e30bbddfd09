//! Notification planner reacting to recipient lifecycle events.
//!
//! Materialises the next occurrence of each recipient's birthday into a
//! scheduled-send record, and keeps records consistent when birth dates
//! or timezones change. Subscribes to the recipient event bus; all
//! failures are logged with the event's trace id and swallowed so other
//! subscribers keep running.
//!
//! Ordering rule: when an edit invalidates an existing record, the queue
//! job is removed BEFORE the record is mutated. A job already claimed by
//! a worker (record in processing) is never cancelled; the new record is
//! planned alongside and the rare overlap is accepted.

use std::sync::Arc;

use async_trait::async_trait;
use tidings_core::{
    idempotency_key, local_send_instant,
    models::{MessageType, NewQueueJob, NewScheduledSend, Recipient},
    next_occurrence, Clock, RecipientEvent, RecipientEventHandler, SendStatus,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::Result, storage::EngineStorage};

/// Annotation stored on a record planned for today after the send hour
/// already passed. The record stays pending so the manual trigger and
/// the next sweep pick it up.
pub const LATE_REGISTRATION_MARKER: &str =
    "recipient created after scheduled send time; awaiting manual trigger";

/// Error detail stored on records cancelled by a birth-date edit.
const BIRTHDATE_CHANGE_CANCELLATION: &str = "cancelled due to birthdate change";

/// Configuration for the notification planner.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Local hour of day (0-23) deliveries are scheduled at.
    pub send_hour: u32,
    /// Message types planned for every recipient.
    pub message_types: Vec<MessageType>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { send_hour: 9, message_types: MessageType::all().to_vec() }
    }
}

/// Plans, adjusts, and cancels scheduled sends in response to recipient
/// lifecycle events.
pub struct NotificationPlanner {
    storage: Arc<dyn EngineStorage>,
    clock: Arc<dyn Clock>,
    config: PlannerConfig,
}

impl std::fmt::Debug for NotificationPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationPlanner").field("config", &self.config).finish_non_exhaustive()
    }
}

impl NotificationPlanner {
    /// Creates a planner over the given storage and clock.
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        clock: Arc<dyn Clock>,
        config: PlannerConfig,
    ) -> Self {
        Self { storage, clock, config }
    }

    /// Plans all configured message types for a recipient.
    ///
    /// # Errors
    ///
    /// Returns error when the timezone is invalid or storage fails.
    pub async fn plan(&self, recipient: &Recipient, trace_id: Uuid) -> Result<()> {
        for message_type in self.config.message_types.clone() {
            self.plan_message(recipient, message_type, trace_id).await?;
        }
        Ok(())
    }

    /// Plans one message type for a recipient.
    ///
    /// Computes the next occurrence and inserts a record keyed by the
    /// idempotency key. Initial status is `Pending` when the occurrence
    /// is today in the recipient's zone, `Unprocessed` otherwise; a
    /// same-day registration after the send hour additionally gets the
    /// late-registration marker.
    async fn plan_message(
        &self,
        recipient: &Recipient,
        message_type: MessageType,
        trace_id: Uuid,
    ) -> Result<()> {
        let tz = recipient.tz()?;
        let now = self.clock.now_utc();
        let occurrence =
            next_occurrence(recipient.birth_date, tz, self.config.send_hour, now)?;

        let today = now.with_timezone(&tz).date_naive();
        if occurrence.local_date < today {
            // The resolver never yields past dates; guard regardless.
            return Ok(());
        }

        let is_today = occurrence.local_date == today;
        let missed_send_hour = is_today && occurrence.utc_instant <= now;

        let record = self
            .storage
            .create_send_if_absent(NewScheduledSend {
                recipient_id: recipient.id,
                message_type,
                scheduled_date: occurrence.local_date,
                scheduled_for: occurrence.utc_instant,
                status: if is_today { SendStatus::Pending } else { SendStatus::Unprocessed },
                error_message: missed_send_hour.then(|| LATE_REGISTRATION_MARKER.to_string()),
            })
            .await?;

        info!(
            trace_id = %trace_id,
            recipient_id = %recipient.id,
            %message_type,
            scheduled_date = %record.scheduled_date,
            scheduled_for = %record.scheduled_for,
            status = %record.status,
            late = missed_send_hour,
            "scheduled send planned"
        );
        Ok(())
    }

    /// Handles a recipient update, replanning where the projection
    /// changed.
    async fn on_updated(&self, old: &Recipient, new: &Recipient, trace_id: Uuid) -> Result<()> {
        let birth_date_changed = old.birth_date != new.birth_date;
        let timezone_changed = old.timezone != new.timezone;

        if !birth_date_changed && !timezone_changed {
            debug!(trace_id = %trace_id, recipient_id = %new.id, "no schedule-relevant change");
            return Ok(());
        }

        for message_type in self.config.message_types.clone() {
            if birth_date_changed {
                self.replan_for_birth_date_change(old, new, message_type, trace_id).await?;
            } else {
                self.reschedule_for_timezone_change(old, new, message_type, trace_id).await?;
            }
        }
        Ok(())
    }

    /// Cancels the record planned from the old birth date (unless it is
    /// already in flight or delivered) and plans the new date.
    async fn replan_for_birth_date_change(
        &self,
        old: &Recipient,
        new: &Recipient,
        message_type: MessageType,
        trace_id: Uuid,
    ) -> Result<()> {
        let old_tz = old.tz()?;
        let now = self.clock.now_utc();
        let old_occurrence =
            next_occurrence(old.birth_date, old_tz, self.config.send_hour, now)?;
        let old_key = idempotency_key(old.id, message_type, old_occurrence.local_date);

        // Remove the queue job before touching the record, closing the
        // race where a worker starts processing an obsolete send.
        let removed = self.storage.remove_queued_job(&old_key).await?;
        if removed {
            debug!(trace_id = %trace_id, key = %old_key, "removed queued job for old birth date");
        }

        if let Some(record) = self.storage.find_send_by_key(&old_key).await? {
            match record.status {
                SendStatus::Processing | SendStatus::Sent => {
                    // In flight or already delivered: leave it alone and
                    // accept the documented double-send window.
                    info!(
                        trace_id = %trace_id,
                        key = %old_key,
                        status = %record.status,
                        "old record past cancellation, planning new date alongside"
                    );
                },
                SendStatus::Unprocessed | SendStatus::Pending => {
                    self.storage
                        .transition_send(
                            record.id,
                            SendStatus::Failed,
                            Some(BIRTHDATE_CHANGE_CANCELLATION.to_string()),
                        )
                        .await?;
                    info!(
                        trace_id = %trace_id,
                        key = %old_key,
                        "cancelled record for old birth date"
                    );
                },
                SendStatus::Failed | SendStatus::Retrying => {},
            }
        }

        self.plan(new, trace_id).await
    }

    /// Recomputes `scheduled_for` for the unchanged local date under the
    /// new zone, re-enqueueing immediately when the instant has already
    /// passed.
    async fn reschedule_for_timezone_change(
        &self,
        old: &Recipient,
        new: &Recipient,
        message_type: MessageType,
        trace_id: Uuid,
    ) -> Result<()> {
        let old_tz = old.tz()?;
        let new_tz = new.tz()?;
        let now = self.clock.now_utc();
        let occurrence = next_occurrence(new.birth_date, old_tz, self.config.send_hour, now)?;
        let key = idempotency_key(new.id, message_type, occurrence.local_date);

        // Same ordering rule as birth-date changes: job first.
        self.storage.remove_queued_job(&key).await?;

        let Some(record) = self.storage.find_send_by_key(&key).await? else {
            // Nothing planned yet (recipient predates the engine, or the
            // record was cancelled); plan from scratch instead.
            return self.plan(new, trace_id).await;
        };

        if matches!(record.status, SendStatus::Processing | SendStatus::Sent) {
            debug!(
                trace_id = %trace_id,
                key = %key,
                status = %record.status,
                "record past rescheduling, leaving untouched"
            );
            return Ok(());
        }

        let new_instant =
            local_send_instant(record.scheduled_date, new_tz, self.config.send_hour)?;
        let updated = self
            .storage
            .update_send_schedule(record.id, record.scheduled_date, new_instant)
            .await?;

        info!(
            trace_id = %trace_id,
            key = %key,
            scheduled_for = %new_instant,
            "rescheduled send for timezone change"
        );

        if new_instant <= now && updated.status == SendStatus::Pending {
            let enqueued = self
                .storage
                .enqueue_job(NewQueueJob {
                    id: key.clone(),
                    recipient_id: new.id,
                    scheduled_for: new_instant,
                    trace_id,
                    run_at: now,
                })
                .await?;
            if enqueued {
                info!(
                    trace_id = %trace_id,
                    key = %key,
                    "send instant already passed in new zone, enqueued immediately"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecipientEventHandler for NotificationPlanner {
    async fn handle_event(&self, event: RecipientEvent) {
        let trace_id = event.trace_id();
        let result = match &event {
            RecipientEvent::Created { recipient, .. } => self.plan(recipient, trace_id).await,
            RecipientEvent::Updated { old, new, .. } => self.on_updated(old, new, trace_id).await,
            // Records survive soft deletion; the worker re-checks the
            // recipient at dispatch time and finalises there.
            RecipientEvent::Deleted { .. } => Ok(()),
        };

        if let Err(err) = result {
            warn!(
                trace_id = %trace_id,
                topic = event.topic(),
                error = %err,
                "planner failed to handle recipient event"
            );
        }
    }
}
