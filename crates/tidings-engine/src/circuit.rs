//! Circuit breaker guarding the outbound delivery endpoint.
//!
//! Fails fast during endpoint outages instead of burning attempts and
//! worker time. The engine talks to a single upstream, so one breaker is
//! shared by all workers.
//!
//! # State machine
//!
//! ```text
//! Closed ──(failure rate >= threshold over the window,
//!           or consecutive-failure trip)──► Open
//! Open ──(30s cooldown)──► HalfOpen (one probe allowed)
//! HalfOpen ──(probe succeeds)──► Closed
//! HalfOpen ──(probe fails)──► Open
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit regardless of rate.
    pub failure_threshold: u32,
    /// Minimum requests in the window before the rate applies.
    pub min_requests_for_rate: u32,
    /// Failure rate (0.0 to 1.0) over the window that trips the circuit.
    pub failure_rate_threshold: f64,
    /// Cooldown before a probe is allowed through an open circuit.
    pub open_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_requests_for_rate: 10,
            failure_rate_threshold: 0.5,
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,
    /// Endpoint unhealthy, requests fail immediately.
    Open,
    /// Testing recovery with a single probe request.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    consecutive_failures: u32,
    total_requests: u32,
    failed_requests: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_requests: 0,
            failed_requests: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            f64::from(self.failed_requests) / f64::from(self.total_requests)
        }
    }

    fn reset_window(&mut self) {
        self.total_requests = 0;
        self.failed_requests = 0;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
    }
}

/// Thread-safe circuit breaker shared by all delivery workers.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    stats: Mutex<CircuitStats>,
}

impl CircuitBreaker {
    /// Creates a breaker in the closed state.
    pub fn new(config: CircuitConfig) -> Self {
        Self { config, stats: Mutex::new(CircuitStats::new()) }
    }

    /// Whether a request may proceed right now.
    ///
    /// An open circuit transitions to half-open once the cooldown has
    /// elapsed; the first caller after that gets the single probe slot.
    pub async fn should_allow_request(&self) -> bool {
        let mut stats = self.stats.lock().await;

        if stats.state == CircuitState::Open {
            let cooled_down = stats
                .opened_at
                .is_some_and(|opened_at| opened_at.elapsed() >= self.config.open_timeout);
            if cooled_down {
                tracing::info!("circuit breaker transitioning to half-open");
                stats.state = CircuitState::HalfOpen;
                stats.probe_in_flight = false;
            }
        }

        match stats.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if stats.probe_in_flight {
                    false
                } else {
                    stats.probe_in_flight = true;
                    true
                }
            },
        }
    }

    /// Records a successful request outcome.
    pub async fn record_success(&self) {
        let mut stats = self.stats.lock().await;
        stats.total_requests += 1;
        stats.consecutive_failures = 0;

        match stats.state {
            CircuitState::Closed => {},
            CircuitState::Open => {
                tracing::warn!("success recorded while circuit open");
            },
            CircuitState::HalfOpen => {
                tracing::info!("circuit breaker closing, endpoint recovered");
                stats.state = CircuitState::Closed;
                stats.opened_at = None;
                stats.reset_window();
            },
        }
    }

    /// Records a failed request outcome, opening the circuit when the
    /// thresholds are exceeded.
    pub async fn record_failure(&self) {
        let mut stats = self.stats.lock().await;
        stats.total_requests += 1;
        stats.failed_requests += 1;
        stats.consecutive_failures += 1;

        match stats.state {
            CircuitState::Closed => {
                let tripped = stats.consecutive_failures >= self.config.failure_threshold
                    || (stats.total_requests >= self.config.min_requests_for_rate
                        && stats.failure_rate() >= self.config.failure_rate_threshold);
                if tripped {
                    tracing::warn!(
                        consecutive_failures = stats.consecutive_failures,
                        failure_rate = stats.failure_rate(),
                        "circuit breaker opening"
                    );
                    stats.state = CircuitState::Open;
                    stats.opened_at = Some(Instant::now());
                }
            },
            CircuitState::Open => {},
            CircuitState::HalfOpen => {
                tracing::warn!("probe failed, circuit breaker reopening");
                stats.state = CircuitState::Open;
                stats.opened_at = Some(Instant::now());
                stats.probe_in_flight = false;
            },
        }
    }

    /// Current breaker state.
    pub async fn state(&self) -> CircuitState {
        self.stats.lock().await.state
    }

    /// Forces the breaker into a specific state (tests and operations).
    pub async fn force_state(&self, state: CircuitState) {
        let mut stats = self.stats.lock().await;
        stats.state = state;
        match state {
            CircuitState::Open => stats.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                stats.opened_at = None;
                stats.reset_window();
            },
            CircuitState::HalfOpen => stats.probe_in_flight = false,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}
