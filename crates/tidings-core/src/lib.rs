//! Core domain models and scheduling primitives.
//!
//! Provides strongly-typed domain entities, the birthday occurrence
//! resolver, recipient lifecycle events, and the PostgreSQL repository
//! layer for the Tidings delivery pipeline. All other crates depend on
//! these foundational types for type safety and consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod schedule;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{EventBus, RecipientEvent, RecipientEventHandler};
pub use models::{
    idempotency_key, JobStatus, MessageType, NewQueueJob, NewScheduledSend, QueueJob, Recipient,
    RecipientId, ScheduledSend, SendId, SendStatus,
};
pub use schedule::{
    duration_until_next_hour, is_same_local_date, local_send_instant, matches_local_birthday,
    next_occurrence, Occurrence,
};
pub use time::{Clock, RealClock};
