//! Reserve, payment verification, webhook and release endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use checkout::{CartLine, InMemoryCatalog, InMemoryOrderBook, ReleaseOutcome, ReservationManager};
use chrono::{DateTime, Utc};
use common::{CheckoutRef, HolderId, PaymentRef};
use ledger::StockLedger;
use payment::{
    IdempotencyLedger, PaymentError, PaymentGateway, PaymentProvider, ProviderOrder,
    WebhookOutcome,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Header carrying the provider's HMAC over the raw webhook body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub type Manager<L> = ReservationManager<L, InMemoryCatalog, InMemoryOrderBook>;
pub type Gateway<L, I> = PaymentGateway<L, InMemoryCatalog, InMemoryOrderBook, I>;

/// Shared application state accessible from all handlers.
pub struct AppState<L: StockLedger, I: IdempotencyLedger> {
    pub manager: Arc<Manager<L>>,
    pub gateway: Gateway<L, I>,
    pub provider: Arc<dyn PaymentProvider>,
    pub webhook_timeout: std::time::Duration,
    pub success_redirect: String,
}

// -- Request types --

#[derive(Deserialize)]
pub struct ReserveRequest {
    pub items: Vec<CartLine>,
    #[serde(default)]
    pub holder_id: Option<String>,
    #[serde(default)]
    pub shipping_address: Option<String>,
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub order_ref: String,
    pub payment_ref: String,
    pub signature: String,
}

// -- Response types --

#[derive(Serialize)]
pub struct ReserveResponse {
    pub checkout_ref: String,
    pub expires_at: DateTime<Utc>,
    pub total_cents: i64,
    pub lines: Vec<ReservedLineResponse>,
    pub provider_order: ProviderOrder,
}

#[derive(Serialize)]
pub struct ReservedLineResponse {
    pub item_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Serialize)]
pub struct VerifyResponse {
    pub status: &'static str,
    pub order_id: Option<String>,
    pub redirect: Option<String>,
    pub duplicate: bool,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: &'static str,
}

#[derive(Serialize)]
pub struct ReleaseResponse {
    pub released: bool,
    pub items: Vec<ReleasedItemResponse>,
}

#[derive(Serialize)]
pub struct ReleasedItemResponse {
    pub item_id: String,
    pub quantity: u32,
}

// -- Handlers --

/// POST /checkout/reserve — hold every cart line or none, then open a
/// provider order for the held total.
#[tracing::instrument(skip(state, req), fields(lines = req.items.len()))]
pub async fn reserve<L: StockLedger + 'static, I: IdempotencyLedger + 'static>(
    State(state): State<Arc<AppState<L, I>>>,
    Json(req): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<ReserveResponse>), ApiError> {
    let holder_id = req
        .holder_id
        .filter(|id| !id.trim().is_empty())
        .map(HolderId::new)
        .unwrap_or_default();

    let hold = state
        .manager
        .reserve(req.items, holder_id, req.shipping_address)
        .await?;

    let provider_order = match state.provider.create_order(hold.checkout_ref, hold.total).await {
        Ok(order) => order,
        Err(e) => {
            tracing::warn!(checkout_ref = %hold.checkout_ref, error = %e, "provider order failed, releasing hold");
            if let Err(release_err) = state.manager.release(hold.checkout_ref).await {
                tracing::warn!(
                    checkout_ref = %hold.checkout_ref,
                    error = %release_err,
                    "release failed, leaving hold to the sweeper"
                );
            }
            return Err(e.into());
        }
    };

    let response = ReserveResponse {
        checkout_ref: hold.checkout_ref.to_string(),
        expires_at: hold.expires_at,
        total_cents: hold.total.cents(),
        lines: hold
            .lines
            .iter()
            .map(|line| ReservedLineResponse {
                item_id: line.item_id.to_string(),
                quantity: line.quantity,
                unit_price_cents: line.unit_price.cents(),
            })
            .collect(),
        provider_order,
    };

    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /checkout/verify — the buyer's redirect back from the provider.
///
/// Every verification failure gets the same generic answer.
#[tracing::instrument(skip(state, req))]
pub async fn verify<L: StockLedger + 'static, I: IdempotencyLedger + 'static>(
    State(state): State<Arc<AppState<L, I>>>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let outcome = state
        .gateway
        .verify_redirect(
            &req.order_ref,
            PaymentRef::new(req.payment_ref),
            &req.signature,
        )
        .await
        .map_err(|e| match e {
            PaymentError::SignatureMismatch | PaymentError::MalformedCallback(_) => {
                ApiError::PaymentNotVerified
            }
            other => other.into(),
        })?;

    let result = outcome.confirm_result();
    let order_id = result.order_id();
    let redirect = order_id.map(|id| {
        format!("{}/{}", state.success_redirect.trim_end_matches('/'), id)
    });

    Ok(Json(VerifyResponse {
        status: result.status(),
        order_id: order_id.map(|id| id.to_string()),
        redirect,
        duplicate: outcome.is_duplicate(),
    }))
}

/// POST /checkout/webhook — server-to-server payment notification.
///
/// Processing runs on its own task so that a timed-out request never
/// abandons a half-applied confirm; the provider's retry is answered from
/// the idempotency ledger.
#[tracing::instrument(skip(state, headers, body), fields(len = body.len()))]
pub async fn webhook<L: StockLedger + 'static, I: IdempotencyLedger + 'static>(
    State(state): State<Arc<AppState<L, I>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            metrics::counter!("payment_signature_mismatch_total", "path" => "webhook")
                .increment(1);
            ApiError::Unauthorized("missing webhook signature".to_string())
        })?;

    let timeout = state.webhook_timeout;
    let task = tokio::spawn(async move { state.gateway.handle_webhook(&body, &signature).await });

    let outcome = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result?,
        Ok(Err(join_err)) => return Err(ApiError::Internal(join_err.to_string())),
        Err(_) => {
            tracing::warn!(?timeout, "webhook processing timed out");
            return Err(ApiError::Timeout);
        }
    };

    let label = match &outcome {
        WebhookOutcome::Processed(_) => "processed",
        WebhookOutcome::Duplicate(record) if record.confirm_result.is_pending() => {
            // Still in flight elsewhere; keep the provider retrying until
            // the result is stored.
            return Err(ApiError::Timeout);
        }
        WebhookOutcome::Duplicate(_) => "duplicate",
        WebhookOutcome::Released(_) => "released",
        WebhookOutcome::Ignored(_) => "ignored",
    };

    Ok(Json(WebhookResponse {
        received: true,
        outcome: label,
    }))
}

/// POST /checkout/{checkout_ref}/release — buyer cancellation.
#[tracing::instrument(skip(state))]
pub async fn release<L: StockLedger + 'static, I: IdempotencyLedger + 'static>(
    State(state): State<Arc<AppState<L, I>>>,
    Path(checkout_ref): Path<String>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let checkout_ref = CheckoutRef::parse(&checkout_ref)
        .map_err(|e| ApiError::BadRequest(format!("Invalid checkout_ref: {e}")))?;

    let response = match state.manager.release(checkout_ref).await? {
        ReleaseOutcome::Released { items } => ReleaseResponse {
            released: true,
            items: items
                .into_iter()
                .map(|(item_id, quantity)| ReleasedItemResponse {
                    item_id: item_id.to_string(),
                    quantity,
                })
                .collect(),
        },
        ReleaseOutcome::NothingToRelease => ReleaseResponse {
            released: false,
            items: Vec::new(),
        },
    };

    Ok(Json(response))
}
