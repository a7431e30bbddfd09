//! Recipient lifecycle event bus.
//!
//! In-process pub/sub connecting the recipient CRUD surface to the
//! engine. The CRUD layer publishes an event after each committed write;
//! subscribers (the notification planner foremost) react asynchronously.
//! Delivery is fire-and-forget: publishers never block on subscriber
//! completion, and one misbehaving subscriber cannot starve the others.

use std::{fmt, sync::Arc};

use tokio::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::Recipient;

/// Maximum wall-clock time a single subscriber may spend on one event.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Events emitted by the recipient CRUD surface after commit.
#[derive(Debug, Clone)]
pub enum RecipientEvent {
    /// A recipient was created.
    Created {
        /// The newly created recipient.
        recipient: Recipient,
        /// Correlation id of the originating request.
        trace_id: Uuid,
    },

    /// A recipient was updated. Carries both projections so subscribers
    /// can detect which fields changed.
    Updated {
        /// Recipient state before the update.
        old: Recipient,
        /// Recipient state after the update.
        new: Recipient,
        /// Correlation id of the originating request.
        trace_id: Uuid,
    },

    /// A recipient was soft-deleted.
    Deleted {
        /// The recipient as of deletion.
        recipient: Recipient,
        /// Correlation id of the originating request.
        trace_id: Uuid,
    },
}

impl RecipientEvent {
    /// Correlation id carried by any variant.
    pub fn trace_id(&self) -> Uuid {
        match self {
            Self::Created { trace_id, .. }
            | Self::Updated { trace_id, .. }
            | Self::Deleted { trace_id, .. } => *trace_id,
        }
    }

    /// Topic name for logging.
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::Created { .. } => "recipient_created",
            Self::Updated { .. } => "recipient_updated",
            Self::Deleted { .. } => "recipient_deleted",
        }
    }
}

/// Trait for subscribers to recipient lifecycle events.
///
/// Implementations must not propagate failures back to the publisher;
/// log with the event's trace id and swallow.
#[async_trait::async_trait]
pub trait RecipientEventHandler: Send + Sync + fmt::Debug {
    /// Handles one recipient lifecycle event.
    async fn handle_event(&self, event: RecipientEvent);
}

/// Fans recipient events out to all registered subscribers.
///
/// Each subscriber runs in a detached task with a timeout, so a
/// panicking or hanging subscriber cannot crash or block the publisher.
/// Subscribers are registered at process start, before any publish.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn RecipientEventHandler>>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self { subscribers: Vec::new() }
    }

    /// Registers a subscriber for all topics.
    pub fn subscribe(&mut self, handler: Arc<dyn RecipientEventHandler>) {
        self.subscribers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publishes an event to every subscriber, best-effort.
    ///
    /// Returns as soon as the subscriber tasks are spawned.
    pub fn publish(&self, event: RecipientEvent) {
        debug!(
            topic = event.topic(),
            trace_id = %event.trace_id(),
            subscribers = self.subscribers.len(),
            "publishing recipient event"
        );

        for handler in &self.subscribers {
            let handler = handler.clone();
            let event = event.clone();

            tokio::spawn(async move {
                let trace_id = event.trace_id();
                let topic = event.topic();
                if tokio::time::timeout(HANDLER_TIMEOUT, handler.handle_event(event))
                    .await
                    .is_err()
                {
                    error!(
                        handler = ?handler,
                        topic,
                        trace_id = %trace_id,
                        timeout_secs = HANDLER_TIMEOUT.as_secs(),
                        "event subscriber timed out"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{NaiveDate, Utc};

    use super::*;
    use crate::models::RecipientId;

    const SETTLE: Duration = Duration::from_millis(100);

    fn sample_recipient() -> Recipient {
        Recipient {
            id: RecipientId::new(),
            first_name: "John".to_string(),
            last_name: "Doe".to_string(),
            email: "john@x".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1990, 1, 15).unwrap(),
            timezone: "America/New_York".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[derive(Debug)]
    struct CountingHandler {
        seen: Arc<AtomicUsize>,
    }

    impl CountingHandler {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let seen = Arc::new(AtomicUsize::new(0));
            (Self { seen: seen.clone() }, seen)
        }
    }

    #[async_trait::async_trait]
    impl RecipientEventHandler for CountingHandler {
        async fn handle_event(&self, _event: RecipientEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct PanickingHandler;

    #[async_trait::async_trait]
    impl RecipientEventHandler for PanickingHandler {
        #[allow(clippy::panic)] // Controlled use to verify isolation
        async fn handle_event(&self, _event: RecipientEvent) {
            panic!("simulated subscriber failure");
        }
    }

    #[derive(Debug)]
    struct SlowHandler;

    #[async_trait::async_trait]
    impl RecipientEventHandler for SlowHandler {
        async fn handle_event(&self, _event: RecipientEvent) {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn all_subscribers_receive_each_event() {
        let mut bus = EventBus::new();
        let (first, first_count) = CountingHandler::new();
        let (second, second_count) = CountingHandler::new();
        bus.subscribe(Arc::new(first));
        bus.subscribe(Arc::new(second));

        bus.publish(RecipientEvent::Created {
            recipient: sample_recipient(),
            trace_id: Uuid::new_v4(),
        });
        tokio::time::sleep(SETTLE).await;

        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_block_others() {
        let mut bus = EventBus::new();
        let (counting, count) = CountingHandler::new();
        bus.subscribe(Arc::new(PanickingHandler));
        bus.subscribe(Arc::new(counting));

        bus.publish(RecipientEvent::Deleted {
            recipient: sample_recipient(),
            trace_id: Uuid::new_v4(),
        });
        tokio::time::sleep(SETTLE).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_does_not_wait_for_slow_subscribers() {
        let mut bus = EventBus::new();
        bus.subscribe(Arc::new(SlowHandler));

        let start = tokio::time::Instant::now();
        bus.publish(RecipientEvent::Created {
            recipient: sample_recipient(),
            trace_id: Uuid::new_v4(),
        });
        assert!(start.elapsed() < SETTLE, "publish must not await subscribers");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.publish(RecipientEvent::Created {
            recipient: sample_recipient(),
            trace_id: Uuid::new_v4(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn updated_event_exposes_trace_id() {
        let trace_id = Uuid::new_v4();
        let event = RecipientEvent::Updated {
            old: sample_recipient(),
            new: sample_recipient(),
            trace_id,
        };
        assert_eq!(event.trace_id(), trace_id);
        assert_eq!(event.topic(), "recipient_updated");
    }
}
