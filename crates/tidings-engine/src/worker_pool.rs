//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for supervised
//! delivery worker tasks.

use std::{sync::Arc, time::Duration};

use tidings_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    circuit::CircuitBreaker,
    client::EmailClient,
    error::{EngineError, Result},
    storage::EngineStorage,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats},
};

/// Worker pool that manages delivery worker tasks with supervision.
///
/// Ensures workers are spawned together, monitored, and collectively
/// cancelled; dropping the pool without a graceful shutdown forces
/// cancellation so tasks are never orphaned.
pub struct WorkerPool {
    storage: Arc<dyn EngineStorage>,
    config: DeliveryConfig,
    client: Arc<EmailClient>,
    circuit: Arc<CircuitBreaker>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates a new worker pool with the given configuration.
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        config: DeliveryConfig,
        client: Arc<EmailClient>,
        circuit: Arc<CircuitBreaker>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            config,
            client,
            circuit,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns all configured workers and begins processing.
    ///
    /// Workers run until cancellation is requested. Returns immediately
    /// after spawning.
    ///
    /// # Errors
    ///
    /// Currently never fails; the signature allows future validation.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        info!(concurrency = self.config.concurrency, "spawning delivery workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.concurrency;
        }

        for worker_id in 0..self.config.concurrency {
            let worker = DeliveryWorker::new(
                worker_id,
                self.storage.clone(),
                self.config.clone(),
                self.client.clone(),
                self.circuit.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");

        Ok(())
    }

    /// Gracefully shuts down all workers, waiting for in-flight
    /// deliveries to complete within the timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` when workers do not finish in time.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let shutdown_future = async {
            for (worker_id, handle) in
                std::mem::take(&mut self.worker_handles).into_iter().enumerate()
            {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                    },
                }
            }

            let mut stats = self.stats.write().await;
            stats.active_workers = 0;
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(EngineError::internal(format!(
                    "worker shutdown timed out after {}s",
                    timeout.as_secs()
                )))
            },
        }
    }

    /// Whether any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "worker pool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}
