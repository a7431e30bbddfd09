//! Test infrastructure shared across the Tidings workspace.
//!
//! Provides a deterministic clock and model fixtures so scheduling,
//! planning, and delivery logic can be exercised without real time,
//! a database, or the network.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod time;

pub use time::TestClock;
