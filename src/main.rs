//! Courier service binary.
//!
//! Start-up order: configuration, tracing, database and migrations, delivery
//! engine, HTTP API. Shutdown runs the other way: stop accepting events,
//! let the API drain, stop the workers, close the pool.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{create_router, shutdown_signal, start_server, AppState, Config};
use courier_core::{storage::Storage, Clock, RealClock, TracingEventHandler};
use courier_delivery::DeliveryEngine;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Connection attempts before start-up gives up on the database.
const CONNECT_ATTEMPTS: u32 = 6;
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        workers = config.worker_pool_size,
        inline_threshold = config.inline_threshold_bytes,
        retry_window_secs = config.retry_window_seconds,
        "courier starting"
    );

    let pool = connect(&config).await?;
    courier_core::storage::migrations::run(&pool).await.context("schema migration failed")?;

    let storage = Arc::new(Storage::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let mut engine = DeliveryEngine::postgres(
        storage.clone(),
        config.to_delivery_config(),
        clock.clone(),
        Arc::new(TracingEventHandler),
    )
    .context("delivery engine configuration rejected")?;
    engine.start().await.context("delivery engine failed to start")?;

    let addr = config.parse_server_addr()?;
    let app = create_router(
        AppState::new(engine.fanout(), engine.cache(), clock).with_storage(storage),
        config.to_http_config(),
    );

    let stop_api = CancellationToken::new();
    let api = tokio::spawn(start_server(app, addr, stop_api.clone().cancelled_owned()));

    shutdown_signal().await;
    stop_api.cancel();

    let drain = Duration::from_secs(config.request_timeout);
    match tokio::time::timeout(drain, api).await {
        Ok(Ok(Ok(()))) => {},
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server failed"),
        Ok(Err(e)) => error!(error = %e, "HTTP server task panicked"),
        Err(_) => warn!(drain_secs = drain.as_secs(), "HTTP requests still in flight at shutdown"),
    }

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not stop cleanly");
    }

    pool.close().await;
    info!("courier stopped");
    Ok(())
}

/// Installs the fmt subscriber filtered by the configured directives.
fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives)
        .with_context(|| format!("invalid log directives {directives:?}"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true))
        .init();
    Ok(())
}

/// Opens the pool, waiting for a database that is still coming up.
async fn connect(config: &Config) -> Result<PgPool> {
    let options = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
        .idle_timeout(Duration::from_secs(config.database_idle_timeout));

    let mut attempt = 1;
    loop {
        match options.clone().connect(&config.database_url).await {
            Ok(pool) => {
                info!(attempt, "database pool ready");
                return Ok(pool);
            },
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, error = %e, "database not reachable yet");
                tokio::time::sleep(CONNECT_BACKOFF).await;
                attempt += 1;
            },
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("database unreachable after {CONNECT_ATTEMPTS} attempts")
                });
            },
        }
    }
}
