//! Model fixtures for tests.

use chrono::{DateTime, NaiveDate, Utc};
use tidings_core::{
    models::{NewScheduledSend, Recipient, RecipientId, ScheduledSend, SendId},
    MessageType, SendStatus,
};

/// Builds a live recipient with the given birthday and zone.
pub fn recipient(
    first_name: &str,
    last_name: &str,
    email: &str,
    birth_date: NaiveDate,
    timezone: &str,
) -> Recipient {
    Recipient {
        id: RecipientId::new(),
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        email: email.to_string(),
        birth_date,
        timezone: timezone.to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        deleted_at: None,
    }
}

/// Builds the insert payload for a birthday send.
pub fn new_birthday_send(
    recipient_id: RecipientId,
    scheduled_date: NaiveDate,
    scheduled_for: DateTime<Utc>,
    status: SendStatus,
) -> NewScheduledSend {
    NewScheduledSend {
        recipient_id,
        message_type: MessageType::Birthday,
        scheduled_date,
        scheduled_for,
        status,
        error_message: None,
    }
}

/// Materialises a stored record from an insert payload, the way the
/// repository would.
pub fn stored_send(send: &NewScheduledSend) -> ScheduledSend {
    ScheduledSend {
        id: SendId::new(),
        recipient_id: send.recipient_id,
        message_type: send.message_type,
        scheduled_date: send.scheduled_date,
        scheduled_for: send.scheduled_for,
        idempotency_key: send.idempotency_key(),
        status: send.status,
        attempt_count: 0,
        last_attempt_at: None,
        sent_at: None,
        error_message: send.error_message.clone(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
