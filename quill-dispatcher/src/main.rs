//! Quill Dispatcher
//!
//! Long-running worker process for the content job pipeline.
//!
//! Startup:
//! - Configuration: load settings from environment or defaults
//! - Store: connect to PostgreSQL (with retry) and run migrations, or use
//!   the in-memory store
//! - Handlers: one remote step handler per job kind
//!
//! Then runs the configured number of dispatch workers until Ctrl-C. Jobs a
//! crashed dispatcher left `running` are recovered by the workers themselves
//! once their claim lease lapses.

use anyhow::{Context, Result};
use quill_core::domain::job::JobKind;
use quill_dispatcher::handler::{HandlerRegistry, RemoteStepHandler};
use quill_dispatcher::{Config, Dispatcher, StoreBackend};
use quill_store::db;
use quill_store::{InMemoryJobStore, JobStore, PgJobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quill_dispatcher=info,quill_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Quill Dispatcher");

    let config = Config::from_env().context("Invalid dispatcher configuration")?;
    config.validate()?;
    info!(
        "Loaded configuration: dispatcher_id={}, store={:?}, collaborator_url={}, workers={}, claim_lease={:?}",
        config.dispatcher_id,
        config.store,
        config.collaborator_url,
        config.workers,
        config.claim_lease
    );

    let store = open_store(&config).await?;

    let registry = build_registry(&config)?;
    info!("Registered step handlers: {:?}", registry.kinds());

    let settings = config.dispatch_settings()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();

    for n in 0..config.workers {
        let dispatcher = Dispatcher::new(
            format!("{}-{}", config.dispatcher_id, n),
            store.clone(),
            registry.clone(),
            settings.clone(),
        );
        let shutdown = shutdown_rx.clone();
        workers.spawn(async move { dispatcher.run(shutdown).await });
    }

    info!("Dispatcher initialized with {} worker(s)", config.workers);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, finishing in-flight jobs");
    // Workers may all have exited already; nothing left to notify then
    let _ = shutdown_tx.send(true);

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Dispatch worker panicked: {}", e);
        }
    }

    info!("Quill Dispatcher stopped");
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn JobStore>> {
    match config.store {
        StoreBackend::Memory => {
            warn!("Using the in-memory job store; jobs are lost on exit");
            Ok(Arc::new(InMemoryJobStore::new()))
        }
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL environment variable not set")?;
            let pool = connect_with_retry(database_url).await?;

            info!("Running database migrations");
            db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;

            Ok(Arc::new(PgJobStore::new(pool)))
        }
    }
}

/// Connects to the database with exponential backoff
///
/// The database is often not accepting connections yet when the dispatcher
/// starts alongside it.
async fn connect_with_retry(database_url: &str) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match db::create_pool(database_url).await {
            Ok(pool) => {
                if attempt > 1 {
                    info!("Connected to database after {} attempt(s)", attempt);
                }
                return Ok(pool);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to connect to database after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Failed to connect to database: {}", e));
                }

                warn!(
                    "Failed to connect to database (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}

fn build_registry(config: &Config) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    for kind in JobKind::ALL {
        let handler =
            RemoteStepHandler::new(&config.collaborator_url, kind, config.request_timeout)
                .context("Failed to build collaborator HTTP client")?;
        registry.register(kind, Arc::new(handler));
    }
    Ok(registry)
}
