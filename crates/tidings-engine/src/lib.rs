//! Birthday delivery engine with reliability guarantees.
//!
//! Implements the scheduling and delivery pipeline: the notification
//! planner reacts to recipient lifecycle events, the hourly sweeper
//! promotes and dispatches due sends, and a pool of async workers drains
//! the PostgreSQL-backed dispatch queue through a circuit breaker with
//! exponential backoff. `FOR UPDATE SKIP LOCKED` gives lock-free work
//! distribution across workers.
//!
//! # Pipeline
//!
//! ```text
//!  recipient events ──► NotificationPlanner ──► scheduled_sends
//!                                                   │
//!                     HourlySweeper (minute 0) ─────┤ promote + dispatch
//!                                                   ▼
//!                                               queue_jobs
//!                                                   │  SKIP LOCKED claims
//!                           ┌───────────────────────┼─────────────────────┐
//!                           ▼                       ▼                     ▼
//!                      Worker 1                Worker 2  ...         Worker N
//!                           │                       │                     │
//!                           └───────── circuit breaker + HTTP ────────────┘
//!                                                   │
//!                                           external endpoint
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod error;
pub mod planner;
pub mod retry;
pub mod storage;
pub mod sweeper;
pub mod worker;
pub mod worker_pool;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use client::{ClientConfig, EmailClient, SendOutcome};
pub use error::{EngineError, Result};
pub use planner::{NotificationPlanner, PlannerConfig, LATE_REGISTRATION_MARKER};
pub use retry::RetryPolicy;
pub use storage::{EngineStorage, PostgresEngineStorage};
pub use sweeper::{HourlySweeper, SweepSummary, SweeperConfig};
pub use worker::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use worker_pool::WorkerPool;

/// Default number of concurrent delivery workers.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default batch size when claiming jobs from the queue.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default delivery attempt ceiling per send.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
