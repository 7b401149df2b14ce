//! API server entry point.

use std::sync::Arc;

use checkout::ExpirySweeper;
use ledger::{InMemoryStockLedger, PostgresStockLedger, StockLedger};
use metrics_exporter_prometheus::PrometheusHandle;
use payment::{
    IdempotencyLedger, IdempotencyPurge, InMemoryIdempotencyLedger, PostgresIdempotencyLedger,
};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use api::config::Config;

/// Resolves on SIGINT or SIGTERM and tells background workers to stop.
async fn shutdown_signal(workers: watch::Sender<bool>) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "SIGINT handler failed");
            }
            "SIGINT"
        }
        () = terminate => "SIGTERM",
    };
    tracing::info!(signal = received, "shutting down");
    let _ = workers.send(true);
}

#[tokio::main]
async fn main() {
    // Logging first so config problems are reported
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("invalid configuration");
    if config.using_dev_secrets() {
        tracing::warn!("CALLBACK_SECRET/WEBHOOK_SECRET not set, using development secrets");
    }

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    api::routes::metrics::describe();

    // Postgres when configured, otherwise everything in memory
    match config.database_url.clone() {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(20)
                .connect(&url)
                .await
                .expect("failed to connect to database");
            let ledger = PostgresStockLedger::new(pool.clone());
            ledger
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL ledger");
            serve(config, ledger, PostgresIdempotencyLedger::new(pool), metrics_handle).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory ledger");
            serve(
                config,
                InMemoryStockLedger::new(),
                InMemoryIdempotencyLedger::new(),
                metrics_handle,
            )
            .await;
        }
    }
}

async fn serve<L, I>(config: Config, ledger: L, idempotency: I, metrics_handle: PrometheusHandle)
where
    L: StockLedger + 'static,
    I: IdempotencyLedger + Clone + 'static,
{
    let state = api::create_state(ledger, idempotency.clone(), &config)
        .await
        .expect("failed to seed catalog");

    // Background reclamation of expired holds
    let sweeper = ExpirySweeper::new(state.manager.clone(), config.sweeper_config()).with_hook(
        Arc::new(IdempotencyPurge::new(
            idempotency,
            config.idempotency_retention(),
        )),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_task = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .expect("server error");

    if let Err(e) = sweeper_task.await {
        tracing::warn!(error = %e, "sweeper task ended abnormally");
    }

    tracing::info!("server stopped");
}
