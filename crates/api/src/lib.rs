//! HTTP API server for the checkout engine.
//!
//! Provides REST endpoints for reserving carts, verifying payments and
//! receiving provider webhooks, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use checkout::{InMemoryCatalog, InMemoryOrderBook, ReservationManager};
use ledger::{LedgerError, StockLedger};
use metrics_exporter_prometheus::PrometheusHandle;
use payment::{IdempotencyLedger, PaymentGateway, PaymentProvider, SandboxProvider};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::checkout::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<L, I>(state: Arc<AppState<L, I>>, metrics_handle: PrometheusHandle) -> Router
where
    L: StockLedger + 'static,
    I: IdempotencyLedger + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/checkout/reserve", post(routes::checkout::reserve::<L, I>))
        .route("/checkout/verify", post(routes::checkout::verify::<L, I>))
        .route("/checkout/webhook", post(routes::checkout::webhook::<L, I>))
        .route(
            "/checkout/{checkout_ref}/release",
            post(routes::checkout::release::<L, I>),
        )
        .route("/stock/{item_id}", get(routes::stock::get::<L, I>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the application state over the given ledgers with the in-memory
/// catalog, order book and sandbox provider, seeding items from the config.
///
/// Seeded items that already exist in the ledger keep their stock; only
/// their catalog price is set.
pub async fn create_state<L, I>(
    ledger: L,
    idempotency: I,
    config: &Config,
) -> Result<Arc<AppState<L, I>>, LedgerError>
where
    L: StockLedger + 'static,
    I: IdempotencyLedger + 'static,
{
    create_state_with_provider(ledger, idempotency, Arc::new(SandboxProvider::default()), config)
        .await
}

/// Like [`create_state`] with a caller-supplied payment provider.
pub async fn create_state_with_provider<L, I>(
    ledger: L,
    idempotency: I,
    provider: Arc<dyn PaymentProvider>,
    config: &Config,
) -> Result<Arc<AppState<L, I>>, LedgerError>
where
    L: StockLedger + 'static,
    I: IdempotencyLedger + 'static,
{
    let catalog = InMemoryCatalog::new();
    for seed in &config.seed_catalog {
        if ledger.stock_level(&seed.item_id).await?.is_none() {
            ledger.list_item(&seed.item_id, seed.stock).await?;
        }
        catalog.set_price(seed.item_id.clone(), seed.price).await;
    }
    if !config.seed_catalog.is_empty() {
        tracing::info!(items = config.seed_catalog.len(), "catalog seeded");
    }

    let manager = Arc::new(ReservationManager::new(
        ledger,
        catalog,
        InMemoryOrderBook::new(),
        config.manager_config(),
    ));
    let gateway = PaymentGateway::new(manager.clone(), idempotency, config.gateway_config());

    Ok(Arc::new(AppState {
        manager,
        gateway,
        provider,
        webhook_timeout: config.webhook_timeout(),
        success_redirect: config.success_redirect.clone(),
    }))
}
