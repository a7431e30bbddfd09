//! Tidings notification delivery service.
//!
//! Main entry point. Initialises all subsystems and coordinates
//! graceful startup and shutdown: configuration, database pool and
//! migrations, the recipient event bus with the planner subscribed, the
//! delivery worker pool, the hourly sweeper, and the HTTP surface.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tidings_api::{AppState, Config};
use tidings_core::{EventBus, RealClock};
use tidings_engine::{
    DeliveryEngine, HourlySweeper, NotificationPlanner, PostgresEngineStorage,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting Tidings notification delivery service");

    let config = Config::load()?;
    let server_addr = config.parse_server_addr()?;
    info!(
        database_url = %config.database_url_masked(),
        %server_addr,
        send_hour = config.birthday_message_hour,
        concurrency = config.queue_concurrency,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database migrations completed");

    let storage = Arc::new(tidings_core::storage::Storage::new(db_pool.clone()));
    let engine_storage: Arc<dyn tidings_engine::EngineStorage> =
        Arc::new(PostgresEngineStorage::new(storage));
    let clock = Arc::new(RealClock::new());

    // The recipient CRUD surface publishes into this bus after each
    // committed write; the planner reacts to keep schedules consistent.
    let planner = Arc::new(NotificationPlanner::new(
        engine_storage.clone(),
        clock.clone(),
        config.to_planner_config(),
    ));
    let mut event_bus = EventBus::new();
    event_bus.subscribe(planner);
    let event_bus = Arc::new(event_bus);

    let mut engine =
        DeliveryEngine::new(engine_storage.clone(), config.to_delivery_config(), clock.clone())?;
    engine.start().await?;

    let sweeper = Arc::new(HourlySweeper::new(
        engine_storage,
        clock,
        config.to_sweeper_config(),
    ));
    let sweeper_token = CancellationToken::new();
    let sweeper_handle = tokio::spawn({
        let sweeper = sweeper.clone();
        let token = sweeper_token.clone();
        async move { sweeper.run(token).await }
    });

    let shutdown_token = CancellationToken::new();
    let server_handle = tokio::spawn({
        let state = AppState::new(sweeper, event_bus);
        let config = config.clone();
        let token = shutdown_token.clone();
        async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = tidings_api::start_server(state, &config, server_addr, shutdown).await {
                error!(error = %e, "server failed");
            }
        }
    });

    info!(%server_addr, "Tidings is up");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    // Stop sourcing new work before draining in-flight deliveries.
    sweeper_token.cancel();
    shutdown_token.cancel();
    let _ = sweeper_handle.await;

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine shutdown incomplete");
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(config.shutdown_timeout_seconds)) => {
            info!("shutdown grace period expired");
        }
        _ = server_handle => {
            info!("server stopped");
        }
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("Tidings shutdown complete");
    Ok(())
}

/// Initialises tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tidings=debug,tower_http=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Runs database migrations.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recipients (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            birth_date DATE NOT NULL,
            timezone TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            deleted_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create recipients table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_sends (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            recipient_id UUID NOT NULL REFERENCES recipients(id),
            message_type TEXT NOT NULL,
            scheduled_date DATE NOT NULL,
            scheduled_for TIMESTAMPTZ NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TIMESTAMPTZ,
            sent_at TIMESTAMPTZ,
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create scheduled_sends table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_jobs (
            id TEXT PRIMARY KEY,
            recipient_id UUID NOT NULL,
            scheduled_for TIMESTAMPTZ NOT NULL,
            trace_id UUID NOT NULL,
            run_at TIMESTAMPTZ NOT NULL,
            attempts_made INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'queued',
            last_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create queue_jobs table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_scheduled_sends_status_for
        ON scheduled_sends(status, scheduled_for)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create scheduled_sends status index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_scheduled_sends_recipient
        ON scheduled_sends(recipient_id, scheduled_date, message_type)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create scheduled_sends recipient index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_scheduled_sends_open
        ON scheduled_sends(scheduled_for)
        WHERE status IN ('unprocessed', 'pending', 'processing', 'retrying')
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create scheduled_sends partial index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_jobs_due
        ON queue_jobs(status, run_at)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create queue_jobs due index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
