//! Boxoffice job worker.
//!
//! Connects to `PostgreSQL`, applies migrations and runs the delayed-job
//! worker until Ctrl+C or SIGTERM:
//!
//! - `expire-transaction`: releases unpaid orders
//! - `organization-response`: cancels orders the organizer never answered
//! - `organizer-followup`: reminds the organizer after acceptance
//!
//! Configuration comes from the environment (see [`config::Config`]).

mod config;

use anyhow::Context;
use boxoffice_core::environment::SystemClock;
use boxoffice_postgres::{PostgresJobQueue, PostgresStore};
use boxoffice_runtime::metrics::MetricsServer;
use boxoffice_runtime::{HandlerRegistry, JobWorker, TracingNotifier, TransactionLifecycle};
use config::Config;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("boxoffice={},sqlx=warn", config.server.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting boxoffice worker");
    info!(
        payment_window_secs = config.lifecycle.payment_window_secs,
        confirmation_window_secs = config.lifecycle.confirmation_window_secs,
        followup_delay_secs = config.lifecycle.followup_delay_secs,
        concurrency = config.worker.concurrency,
        "Configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout))
        .connect(&config.database.url)
        .await
        .context("connecting to PostgreSQL")?;
    info!("Connected to PostgreSQL");

    boxoffice_postgres::migrate(&pool)
        .await
        .context("applying migrations")?;
    info!("Migrations applied");

    let metrics_addr = config
        .metrics_addr()
        .parse()
        .with_context(|| format!("invalid metrics address {}", config.metrics_addr()))?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.serve().context("starting metrics exporter")?;

    let store = Arc::new(PostgresStore::from_pool(pool.clone()));
    let queue = Arc::new(PostgresJobQueue::new(pool.clone()));
    let clock = Arc::new(SystemClock);

    let lifecycle = Arc::new(
        TransactionLifecycle::builder(store, queue.clone())
            .notifier(Arc::new(TracingNotifier))
            .clock(clock.clone())
            .config(config.lifecycle_config())
            .build(),
    );

    let registry = HandlerRegistry::for_lifecycle(&lifecycle);
    let worker = JobWorker::new(queue, registry, clock, config.worker_config());
    info!(?worker, "Worker ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::select! {
        () = shutdown_signal() => {},
        result = &mut handle => {
            // The worker only returns after a shutdown request
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
            pool.close().await;
            anyhow::bail!("worker stopped unexpectedly");
        },
    }

    let _ = shutdown_tx.send(true);
    let timeout = Duration::from_secs(config.server.shutdown_timeout);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => info!("Worker drained"),
        Ok(Err(e)) => error!(error = %e, "Worker task failed during shutdown"),
        Err(_) => warn!(?timeout, "Shutdown timeout elapsed with jobs still running"),
    }

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
