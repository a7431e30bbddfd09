//! Core domain models and strongly-typed identifiers.
//!
//! Defines recipients, scheduled sends, queue jobs, and newtype ID
//! wrappers for compile-time type safety. Includes database serialization
//! traits and the state transition rules for the scheduled-send lifecycle.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed recipient identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Recipients are
/// owned by the external CRUD surface; the engine only ever reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipientId(pub Uuid);

impl RecipientId {
    /// Creates a new random recipient ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecipientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RecipientId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for RecipientId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RecipientId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for RecipientId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed scheduled-send identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SendId(pub Uuid);

impl SendId {
    /// Creates a new random send ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SendId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SendId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for SendId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SendId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for SendId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Kind of notification a scheduled send delivers.
///
/// Only birthday greetings exist today; the tag is part of the
/// idempotency key so further kinds can be added without migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Birthday greeting, delivered at the configured local hour.
    Birthday,
}

impl MessageType {
    /// All message types the planner schedules for a new recipient.
    pub fn all() -> &'static [MessageType] {
        &[Self::Birthday]
    }

    /// Stable string form used in idempotency keys and the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Birthday => "birthday",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for MessageType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "birthday" => Ok(Self::Birthday),
            _ => Err(format!("invalid message type: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for MessageType {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Scheduled-send lifecycle status.
///
/// Records progress through these states during delivery. Transitions
/// are strictly controlled to maintain consistency:
///
/// ```text
/// Unprocessed -> Pending -> Processing -> Sent
///           |           |             -> Retrying -> Processing ...
///           |           |             -> Failed
///           |           `-> Failed (cancellation)
///           `-> Failed (cancellation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// Planned for a future local date; not yet eligible for dispatch.
    Unprocessed,

    /// Due today in the recipient's zone, waiting to be queued.
    Pending,

    /// A worker is actively delivering this send.
    Processing,

    /// Successfully delivered. Terminal.
    Sent,

    /// Permanently failed or cancelled. Terminal.
    Failed,

    /// Last attempt failed with a retriable error; the queue will
    /// re-deliver after backoff.
    Retrying,
}

impl SendStatus {
    /// Whether this status admits no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Statuses a record may hold immediately before moving to `self`.
    ///
    /// This table is the single authority for the state machine; the
    /// repository enforces it with a conditional update so that
    /// concurrent writers serialise per record.
    pub const fn allowed_sources(self) -> &'static [SendStatus] {
        match self {
            Self::Unprocessed => &[],
            Self::Pending => &[Self::Unprocessed],
            Self::Processing => &[Self::Pending, Self::Retrying],
            Self::Sent => &[Self::Processing],
            Self::Retrying => &[Self::Processing],
            Self::Failed => &[Self::Unprocessed, Self::Pending, Self::Processing, Self::Retrying],
        }
    }

    /// Whether a record in `self` may transition to `next`.
    pub fn can_transition_to(self, next: SendStatus) -> bool {
        next.allowed_sources().contains(&self)
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unprocessed => write!(f, "unprocessed"),
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

impl sqlx::Type<PgDb> for SendStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SendStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "unprocessed" => Ok(Self::Unprocessed),
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            _ => Err(format!("invalid send status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for SendStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Recipient of time-triggered notifications.
///
/// Owned by the external CRUD surface. The engine reads recipients to plan
/// occurrences and to re-check liveness at dispatch time; it never writes
/// them. Soft deletion is signalled through `deleted_at`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    /// Unique identifier for this recipient.
    pub id: RecipientId,

    /// Given name, used in the rendered greeting.
    pub first_name: String,

    /// Family name, used in the rendered greeting.
    pub last_name: String,

    /// Destination address for deliveries.
    pub email: String,

    /// Calendar date of birth, no time component.
    pub birth_date: NaiveDate,

    /// IANA timezone identifier (e.g. `America/New_York`).
    ///
    /// Validated at the API boundary; the engine re-parses defensively
    /// because planning against a bad zone must fail loudly, not deliver
    /// at the wrong instant.
    pub timezone: String,

    /// When this recipient was created.
    pub created_at: DateTime<Utc>,

    /// When this recipient was last updated.
    pub updated_at: DateTime<Utc>,

    /// Soft delete timestamp. Workers skip deleted recipients at
    /// dispatch time.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Recipient {
    /// Full name as rendered into the greeting body.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Whether the recipient has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Parses the stored IANA timezone identifier.
    pub fn tz(&self) -> crate::error::Result<chrono_tz::Tz> {
        self.timezone.parse::<chrono_tz::Tz>().map_err(|_| {
            crate::error::CoreError::validation(format!(
                "invalid IANA timezone: {}",
                self.timezone
            ))
        })
    }
}

/// Builds the natural idempotency key for a scheduled send.
///
/// `"{recipient_id}:{message_type}:{scheduled_date}"` is globally unique:
/// at most one record may exist per (recipient, type, local date), and the
/// key doubles as the queue job id so duplicates collapse in both stores.
pub fn idempotency_key(
    recipient_id: RecipientId,
    message_type: MessageType,
    scheduled_date: NaiveDate,
) -> String {
    format!("{recipient_id}:{message_type}:{scheduled_date}")
}

/// Persistent record representing one planned delivery occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledSend {
    /// Surrogate identifier.
    pub id: SendId,

    /// Recipient this send belongs to.
    pub recipient_id: RecipientId,

    /// Kind of notification being delivered.
    pub message_type: MessageType,

    /// Local calendar date of the occurrence in the recipient's zone.
    pub scheduled_date: NaiveDate,

    /// UTC instant of the configured send hour on `scheduled_date`,
    /// projected through the recipient's zone at planning time.
    pub scheduled_for: DateTime<Utc>,

    /// Natural unique key; see [`idempotency_key`].
    pub idempotency_key: String,

    /// Current lifecycle status.
    pub status: SendStatus,

    /// Delivery attempts started so far. Monotonically non-decreasing.
    pub attempt_count: i32,

    /// When the most recent attempt entered processing.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When delivery succeeded. Set exactly when status becomes `Sent`.
    pub sent_at: Option<DateTime<Utc>>,

    /// Failure detail from the latest failed or retried attempt, or a
    /// planning annotation such as the late-registration marker.
    pub error_message: Option<String>,

    /// When this record was created.
    pub created_at: DateTime<Utc>,

    /// When this record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Data needed to insert a scheduled send.
///
/// The repository assigns the surrogate id and audit timestamps; the
/// idempotency key is derived, never supplied.
#[derive(Debug, Clone)]
pub struct NewScheduledSend {
    /// Recipient the send is planned for.
    pub recipient_id: RecipientId,
    /// Kind of notification.
    pub message_type: MessageType,
    /// Local calendar date of the occurrence.
    pub scheduled_date: NaiveDate,
    /// UTC projection of the send hour on `scheduled_date`.
    pub scheduled_for: DateTime<Utc>,
    /// Initial status: `Pending` when the occurrence is today,
    /// `Unprocessed` otherwise.
    pub status: SendStatus,
    /// Optional planning annotation (late-registration marker).
    pub error_message: Option<String>,
}

impl NewScheduledSend {
    /// Idempotency key this record will be stored under.
    pub fn idempotency_key(&self) -> String {
        idempotency_key(self.recipient_id, self.message_type, self.scheduled_date)
    }
}

/// Queue job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its `run_at` instant.
    Queued,
    /// Claimed by a worker.
    Active,
    /// Exhausted retries; retained for inspection, purged after the
    /// retention window.
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid job status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for JobStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Durable dispatch job.
///
/// The job id equals the scheduled send's idempotency key, so enqueues are
/// idempotent: the same key yields a single queued or active job. Completed
/// jobs are deleted; failed jobs are retained for a bounded period.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueJob {
    /// Job id; equals the scheduled send's idempotency key.
    pub id: String,

    /// Recipient the payload refers to.
    pub recipient_id: RecipientId,

    /// UTC instant the send was scheduled for.
    pub scheduled_for: DateTime<Utc>,

    /// Correlation id propagated through logs.
    pub trace_id: Uuid,

    /// Earliest instant a worker may claim this job. Backoff reschedules
    /// push this forward.
    pub run_at: DateTime<Utc>,

    /// Delivery attempts started, including the one currently active.
    pub attempts_made: i32,

    /// Current queue status.
    pub status: JobStatus,

    /// Error detail from the most recent failed attempt.
    pub last_error: Option<String>,

    /// When this job was first enqueued.
    pub created_at: DateTime<Utc>,

    /// When this job last changed state.
    pub updated_at: DateTime<Utc>,
}

/// Data needed to enqueue a dispatch job.
#[derive(Debug, Clone)]
pub struct NewQueueJob {
    /// Job id; must equal the scheduled send's idempotency key.
    pub id: String,
    /// Recipient the payload refers to.
    pub recipient_id: RecipientId,
    /// UTC instant the send was scheduled for.
    pub scheduled_for: DateTime<Utc>,
    /// Correlation id propagated through logs.
    pub trace_id: Uuid,
    /// Earliest instant a worker may claim the job.
    pub run_at: DateTime<Utc>,
}
