//! Redirect and webhook entry points for payment confirmation.

use std::sync::Arc;

use checkout::{
    Catalog, CheckoutError, ConfirmOutcome, OrderBook, ReleaseOutcome, ReservationManager,
};
use chrono::{Duration, Utc};
use common::{CheckoutRef, PaymentRef};
use ledger::StockLedger;
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};
use crate::idempotency::{ConfirmResult, IdempotencyLedger, IdempotencyRecord, InsertOutcome};
use crate::signature;

const CAPTURED: &str = "payment.captured";
const FAILED: &str = "payment.failed";

/// Secrets and timing for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub callback_secret: String,
    pub webhook_secret: String,
    /// A record still `Pending` after this long is assumed orphaned by a
    /// crashed process and its confirm is run again.
    pub pending_takeover_after: Duration,
}

impl GatewayConfig {
    pub fn new(callback_secret: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            callback_secret: callback_secret.into(),
            webhook_secret: webhook_secret.into(),
            pending_takeover_after: Duration::seconds(60),
        }
    }
}

/// Provider webhook body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub payload: WebhookPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub order_ref: String,
    #[serde(default)]
    pub payment_ref: Option<String>,
}

/// Result of a redirect verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// This call ran confirm.
    Confirmed {
        checkout_ref: CheckoutRef,
        result: ConfirmResult,
    },
    /// The payment reference was already processed.
    Duplicate(IdempotencyRecord),
}

impl VerifyOutcome {
    pub fn confirm_result(&self) -> &ConfirmResult {
        match self {
            VerifyOutcome::Confirmed { result, .. } => result,
            VerifyOutcome::Duplicate(record) => &record.confirm_result,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, VerifyOutcome::Duplicate(_))
    }
}

/// Result of a webhook delivery. Every variant is acknowledged to the
/// provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed(ConfirmResult),
    Duplicate(IdempotencyRecord),
    Released(ReleaseOutcome),
    Ignored(String),
}

/// Verifies payment callbacks and drives confirm or release.
pub struct PaymentGateway<L, C, O, I>
where
    L: StockLedger,
    C: Catalog,
    O: OrderBook,
    I: IdempotencyLedger,
{
    manager: Arc<ReservationManager<L, C, O>>,
    idempotency: I,
    config: GatewayConfig,
}

impl<L, C, O, I> PaymentGateway<L, C, O, I>
where
    L: StockLedger,
    C: Catalog,
    O: OrderBook,
    I: IdempotencyLedger,
{
    pub fn new(
        manager: Arc<ReservationManager<L, C, O>>,
        idempotency: I,
        config: GatewayConfig,
    ) -> Self {
        Self {
            manager,
            idempotency,
            config,
        }
    }

    pub fn idempotency(&self) -> &I {
        &self.idempotency
    }

    /// Handles the buyer's redirect back from the provider.
    ///
    /// A known payment reference short-circuits before any crypto. A bad
    /// signature releases the checkout and fails with
    /// [`PaymentError::SignatureMismatch`].
    #[tracing::instrument(skip(self, payment_ref, signature), fields(%payment_ref))]
    pub async fn verify_redirect(
        &self,
        order_ref: &str,
        payment_ref: PaymentRef,
        signature: &str,
    ) -> Result<VerifyOutcome> {
        if let Some(existing) = self.idempotency.get(&payment_ref).await? {
            return self.replay(existing, "verify").await.map(|replayed| match replayed {
                Replayed::Duplicate(record) => VerifyOutcome::Duplicate(record),
                Replayed::Redriven(checkout_ref, result) => {
                    VerifyOutcome::Confirmed { checkout_ref, result }
                }
            });
        }

        if !signature::verify_redirect(
            &self.config.callback_secret,
            order_ref,
            payment_ref.as_str(),
            signature,
        ) {
            metrics::counter!("payment_signature_mismatch_total", "path" => "verify").increment(1);
            tracing::warn!(order_ref, "redirect signature mismatch");
            if let Ok(checkout_ref) = CheckoutRef::parse(order_ref) {
                match self.manager.release(checkout_ref).await {
                    Ok(outcome) => tracing::info!(
                        %checkout_ref,
                        released = outcome.released_anything(),
                        "checkout released after signature mismatch"
                    ),
                    Err(e) => {
                        tracing::warn!(%checkout_ref, error = %e, "release after signature mismatch failed")
                    }
                }
            }
            return Err(PaymentError::SignatureMismatch);
        }

        let checkout_ref = parse_order_ref(order_ref)?;
        let record = IdempotencyRecord::pending(payment_ref.clone(), checkout_ref, Utc::now());
        if let InsertOutcome::Existing(existing) = self.idempotency.insert_if_absent(&record).await? {
            metrics::counter!("payment_duplicate_total", "path" => "verify").increment(1);
            return Ok(VerifyOutcome::Duplicate(existing));
        }

        let result = self.confirm_and_record(&payment_ref, checkout_ref).await?;
        Ok(VerifyOutcome::Confirmed {
            checkout_ref,
            result,
        })
    }

    /// Handles a provider webhook delivery.
    ///
    /// The signature is checked over the raw bytes before the body is
    /// parsed. Once a captured payment is recorded, a failing confirm is
    /// logged and still reported as processed so the provider stops
    /// retrying.
    #[tracing::instrument(skip(self, body, signature), fields(len = body.len()))]
    pub async fn handle_webhook(&self, body: &[u8], signature: &str) -> Result<WebhookOutcome> {
        if !signature::verify_webhook(&self.config.webhook_secret, body, signature) {
            metrics::counter!("payment_signature_mismatch_total", "path" => "webhook").increment(1);
            tracing::warn!("webhook signature mismatch");
            return Err(PaymentError::SignatureMismatch);
        }

        let event: WebhookEvent = serde_json::from_slice(body)
            .map_err(|e| PaymentError::MalformedCallback(e.to_string()))?;

        match event.event.as_str() {
            CAPTURED => {
                let checkout_ref = parse_order_ref(&event.payload.order_ref)?;
                let payment_ref = event.payload.payment_ref.map(PaymentRef::new).ok_or_else(|| {
                    PaymentError::MalformedCallback("payment_ref missing".to_string())
                })?;
                self.captured(checkout_ref, payment_ref).await
            }
            FAILED => {
                let checkout_ref = parse_order_ref(&event.payload.order_ref)?;
                let outcome = self.manager.release(checkout_ref).await?;
                tracing::info!(
                    %checkout_ref,
                    released = outcome.released_anything(),
                    "payment failed, checkout released"
                );
                Ok(WebhookOutcome::Released(outcome))
            }
            other => {
                tracing::debug!(event = other, "ignoring webhook event");
                Ok(WebhookOutcome::Ignored(other.to_string()))
            }
        }
    }

    async fn captured(
        &self,
        checkout_ref: CheckoutRef,
        payment_ref: PaymentRef,
    ) -> Result<WebhookOutcome> {
        let record = IdempotencyRecord::pending(payment_ref.clone(), checkout_ref, Utc::now());
        if let InsertOutcome::Existing(existing) = self.idempotency.insert_if_absent(&record).await? {
            return self.replay(existing, "webhook").await.map(|replayed| match replayed {
                Replayed::Duplicate(record) => WebhookOutcome::Duplicate(record),
                Replayed::Redriven(_, result) => WebhookOutcome::Processed(result),
            });
        }

        match self.confirm_and_record(&payment_ref, checkout_ref).await {
            Ok(result) => Ok(WebhookOutcome::Processed(result)),
            Err(PaymentError::Checkout(e)) => Ok(WebhookOutcome::Processed(ConfirmResult::Failed {
                reason: e.to_string(),
            })),
            Err(e) => Err(e),
        }
    }

    /// Answers a repeated payment reference from its record, re-running
    /// confirm only when the record was orphaned in `Pending`.
    async fn replay(&self, existing: IdempotencyRecord, path: &'static str) -> Result<Replayed> {
        let age = Utc::now() - existing.verified_at;
        if !existing.confirm_result.is_pending() || age < self.config.pending_takeover_after {
            metrics::counter!("payment_duplicate_total", "path" => path).increment(1);
            tracing::info!(
                payment_ref = %existing.payment_ref,
                checkout_ref = %existing.checkout_ref,
                path,
                "duplicate payment callback"
            );
            return Ok(Replayed::Duplicate(existing));
        }

        tracing::warn!(
            payment_ref = %existing.payment_ref,
            checkout_ref = %existing.checkout_ref,
            age_secs = age.num_seconds(),
            "taking over stale pending payment"
        );
        let result = match self
            .confirm_and_record(&existing.payment_ref, existing.checkout_ref)
            .await
        {
            Ok(result) => result,
            Err(PaymentError::Checkout(e)) => ConfirmResult::Failed {
                reason: e.to_string(),
            },
            Err(e) => return Err(e),
        };
        Ok(Replayed::Redriven(existing.checkout_ref, result))
    }

    /// Runs confirm and stores what happened on the idempotency record.
    ///
    /// Confirm errors are recorded as `Failed` before being returned as
    /// [`PaymentError::Checkout`].
    async fn confirm_and_record(
        &self,
        payment_ref: &PaymentRef,
        checkout_ref: CheckoutRef,
    ) -> Result<ConfirmResult> {
        match self.manager.confirm(checkout_ref).await {
            Ok(outcome) => {
                let order_id = outcome.order().order_id;
                let result = match outcome {
                    ConfirmOutcome::Confirmed(_) => ConfirmResult::Confirmed { order_id },
                    ConfirmOutcome::AlreadyConfirmed(_) => {
                        ConfirmResult::AlreadyConfirmed { order_id }
                    }
                };
                let result = self.settle(payment_ref, result).await?;
                tracing::info!(%payment_ref, %checkout_ref, %order_id, "payment confirmed");
                Ok(result)
            }
            Err(e) => {
                let result = ConfirmResult::Failed {
                    reason: e.to_string(),
                };
                let settled = self.settle(payment_ref, result).await?;
                if settled.is_success() {
                    tracing::info!(
                        %payment_ref,
                        %checkout_ref,
                        "payment already confirmed by a concurrent attempt"
                    );
                    return Ok(settled);
                }
                if matches!(e, CheckoutError::UnknownCheckoutRef(_)) {
                    tracing::warn!(
                        %payment_ref,
                        %checkout_ref,
                        "payment arrived for a checkout that is no longer held"
                    );
                } else {
                    tracing::error!(
                        %payment_ref,
                        %checkout_ref,
                        error = %e,
                        "confirm failed for captured payment"
                    );
                }
                Err(PaymentError::Checkout(e))
            }
        }
    }

    /// Writes `result` to the payment's record. A success stored by a
    /// concurrent attempt is kept and returned in its place.
    async fn settle(
        &self,
        payment_ref: &PaymentRef,
        result: ConfirmResult,
    ) -> Result<ConfirmResult> {
        if self.idempotency.complete(payment_ref, &result).await? {
            return Ok(result);
        }
        match self.idempotency.get(payment_ref).await? {
            Some(stored) if stored.confirm_result.is_success() => Ok(stored.confirm_result),
            _ => Ok(result),
        }
    }
}

enum Replayed {
    Duplicate(IdempotencyRecord),
    Redriven(CheckoutRef, ConfirmResult),
}

fn parse_order_ref(order_ref: &str) -> Result<CheckoutRef> {
    CheckoutRef::parse(order_ref)
        .map_err(|_| PaymentError::MalformedCallback(format!("unknown order reference {order_ref}")))
}

#[cfg(test)]
mod tests {
    use checkout::{CartLine, InMemoryCatalog, InMemoryOrderBook, ManagerConfig};
    use common::{HolderId, ItemId, Money, OrderId};
    use ledger::InMemoryStockLedger;

    use super::*;
    use crate::idempotency::InMemoryIdempotencyLedger;

    type TestGateway = PaymentGateway<
        InMemoryStockLedger,
        InMemoryCatalog,
        InMemoryOrderBook,
        InMemoryIdempotencyLedger,
    >;

    async fn gateway() -> (TestGateway, CheckoutRef) {
        let ledger = InMemoryStockLedger::new();
        ledger.list_item(&ItemId::new("SKU-A"), 5).await.unwrap();
        let catalog = InMemoryCatalog::new();
        catalog.set_price("SKU-A", Money::from_cents(700)).await;
        let manager = Arc::new(ReservationManager::new(
            ledger,
            catalog,
            InMemoryOrderBook::new(),
            ManagerConfig::default(),
        ));
        let hold = manager
            .reserve(vec![CartLine::new("SKU-A", 2)], HolderId::guest(), None)
            .await
            .unwrap();
        let gateway = PaymentGateway::new(
            manager,
            InMemoryIdempotencyLedger::new(),
            GatewayConfig::new("cb", "wh"),
        );
        (gateway, hold.checkout_ref)
    }

    fn redirect_sig(order_ref: &str, payment_ref: &str) -> String {
        signature::sign_redirect("cb", order_ref, payment_ref).unwrap()
    }

    #[tokio::test]
    async fn test_bad_order_ref_with_valid_signature_is_malformed() {
        let (gateway, _) = gateway().await;
        let sig = redirect_sig("not-a-uuid", "pay_1");

        let err = gateway
            .verify_redirect("not-a-uuid", PaymentRef::new("pay_1"), &sig)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::MalformedCallback(_)));
        assert!(gateway.idempotency().is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_pending_record_is_taken_over() {
        let (gateway, checkout_ref) = gateway().await;
        let payment_ref = PaymentRef::new("pay_crashed");
        let orphan = IdempotencyRecord::pending(
            payment_ref.clone(),
            checkout_ref,
            Utc::now() - Duration::minutes(5),
        );
        gateway.idempotency().insert_if_absent(&orphan).await.unwrap();

        let sig = redirect_sig(&checkout_ref.to_string(), "pay_crashed");
        let outcome = gateway
            .verify_redirect(&checkout_ref.to_string(), payment_ref.clone(), &sig)
            .await
            .unwrap();

        assert!(!outcome.is_duplicate());
        assert!(outcome.confirm_result().order_id().is_some());
        let stored = gateway.idempotency().get(&payment_ref).await.unwrap().unwrap();
        assert!(matches!(stored.confirm_result, ConfirmResult::Confirmed { .. }));
    }

    #[tokio::test]
    async fn test_losing_takeover_keeps_winners_result() {
        let (gateway, checkout_ref) = gateway().await;
        let payment_ref = PaymentRef::new("pay_taken_over");
        let orphan = IdempotencyRecord::pending(
            payment_ref.clone(),
            checkout_ref,
            Utc::now() - Duration::minutes(5),
        );
        gateway.idempotency().insert_if_absent(&orphan).await.unwrap();

        let won = gateway.confirm_and_record(&payment_ref, checkout_ref).await.unwrap();
        let lost = gateway.confirm_and_record(&payment_ref, checkout_ref).await.unwrap();

        assert!(matches!(won, ConfirmResult::Confirmed { .. }));
        assert_eq!(lost, won);
        let stored = gateway.idempotency().get(&payment_ref).await.unwrap().unwrap();
        assert_eq!(stored.confirm_result, won);
    }

    #[tokio::test]
    async fn test_late_failure_does_not_overwrite_confirmed_record() {
        let (gateway, _) = gateway().await;
        let payment_ref = PaymentRef::new("pay_settled");
        // The winner confirmed this payment; the loser sees its session gone.
        let gone = CheckoutRef::new();
        let record = IdempotencyRecord::pending(payment_ref.clone(), gone, Utc::now());
        gateway.idempotency().insert_if_absent(&record).await.unwrap();
        let confirmed = ConfirmResult::Confirmed {
            order_id: OrderId::new(),
        };
        gateway
            .idempotency()
            .complete(&payment_ref, &confirmed)
            .await
            .unwrap();

        let result = gateway.confirm_and_record(&payment_ref, gone).await.unwrap();

        assert_eq!(result, confirmed);
        let stored = gateway.idempotency().get(&payment_ref).await.unwrap().unwrap();
        assert_eq!(stored.confirm_result, confirmed);
    }

    #[tokio::test]
    async fn test_fresh_pending_record_is_a_duplicate() {
        let (gateway, checkout_ref) = gateway().await;
        let payment_ref = PaymentRef::new("pay_inflight");
        let inflight = IdempotencyRecord::pending(payment_ref.clone(), checkout_ref, Utc::now());
        gateway.idempotency().insert_if_absent(&inflight).await.unwrap();

        let sig = redirect_sig(&checkout_ref.to_string(), "pay_inflight");
        let outcome = gateway
            .verify_redirect(&checkout_ref.to_string(), payment_ref, &sig)
            .await
            .unwrap();

        assert!(outcome.is_duplicate());
        assert!(outcome.confirm_result().is_pending());
    }

    #[tokio::test]
    async fn test_unknown_webhook_event_ignored() {
        let (gateway, checkout_ref) = gateway().await;
        let body = serde_json::to_vec(&WebhookEvent {
            event: "payment.refunded".to_string(),
            payload: WebhookPayload {
                order_ref: checkout_ref.to_string(),
                payment_ref: Some("pay_1".to_string()),
            },
        })
        .unwrap();
        let sig = signature::sign_webhook("wh", &body).unwrap();

        let outcome = gateway.handle_webhook(&body, &sig).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored("payment.refunded".to_string()));
    }

    #[tokio::test]
    async fn test_captured_without_payment_ref_is_malformed() {
        let (gateway, checkout_ref) = gateway().await;
        let body = format!(
            r#"{{"event":"payment.captured","payload":{{"order_ref":"{checkout_ref}"}}}}"#
        );
        let sig = signature::sign_webhook("wh", body.as_bytes()).unwrap();

        let err = gateway.handle_webhook(body.as_bytes(), &sig).await.unwrap_err();
        assert!(matches!(err, PaymentError::MalformedCallback(_)));
    }
}
