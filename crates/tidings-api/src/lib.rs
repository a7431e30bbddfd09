//! HTTP surface and configuration for the Tidings service.
//!
//! Provides the operator endpoints (health, manual trigger) and the
//! figment-based configuration layer. Recipient CRUD lives in an
//! external collaborator that publishes into the event bus this crate's
//! state carries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

use std::sync::Arc;

use tidings_core::EventBus;
use tidings_engine::HourlySweeper;

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared application state handed to request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sweeper invoked by the manual trigger with `force = true`.
    pub sweeper: Arc<HourlySweeper>,
    /// Event bus the recipient CRUD surface publishes into.
    pub event_bus: Arc<EventBus>,
}

impl AppState {
    /// Creates application state from its services.
    pub fn new(sweeper: Arc<HourlySweeper>, event_bus: Arc<EventBus>) -> Self {
        Self { sweeper, event_bus }
    }
}
