//! Reservation manager: reserve, confirm and release against the ledger.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use common::{CheckoutRef, HolderId, ItemId};
use ledger::{CheckoutLine, CheckoutSession, ReserveOutcome, StockLedger};

use crate::error::{CheckoutError, Result};
use crate::outcome::{
    CartLine, CheckoutHold, ConfirmFailure, ConfirmOutcome, ReleaseOutcome, Shortfall,
};
use crate::services::{Catalog, NewOrder, OrderBook};

/// Limits applied by the reservation manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a hold lives before the sweeper may reclaim it.
    pub reservation_ttl: Duration,
    /// Carts with more distinct lines than this are rejected.
    pub max_cart_lines: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::minutes(10),
            max_cart_lines: 50,
        }
    }
}

/// Creates, confirms and releases reservations.
///
/// Every counter change goes through the [`StockLedger`] primitives. The
/// checkout session is the unit of exclusivity: confirm and release both
/// start by claiming it, so only one of them ever touches the holds.
pub struct ReservationManager<L, C, O>
where
    L: StockLedger,
    C: Catalog,
    O: OrderBook,
{
    ledger: L,
    catalog: C,
    orders: O,
    config: ManagerConfig,
}

impl<L, C, O> ReservationManager<L, C, O>
where
    L: StockLedger,
    C: Catalog,
    O: OrderBook,
{
    /// Creates a new reservation manager.
    pub fn new(ledger: L, catalog: C, orders: O, config: ManagerConfig) -> Self {
        Self {
            ledger,
            catalog,
            orders,
            config,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn orders(&self) -> &O {
        &self.orders
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Holds every line of the cart or none of them.
    ///
    /// Lines are priced from the catalog, a checkout session is opened, and
    /// each line is held with a conditional ledger update. If any line
    /// fails, the lines already held are released before returning an
    /// itemised `InsufficientStock`.
    #[tracing::instrument(
        skip(self, items, holder_id, shipping_address),
        fields(lines = items.len(), %holder_id)
    )]
    pub async fn reserve(
        &self,
        items: Vec<CartLine>,
        holder_id: HolderId,
        shipping_address: Option<String>,
    ) -> Result<CheckoutHold> {
        let started = std::time::Instant::now();
        let cart = self.normalize_cart(items)?;

        let mut shortfalls = Vec::new();
        let mut lines = Vec::with_capacity(cart.len());
        for (item_id, quantity) in cart {
            match self.catalog.trusted_price(&item_id).await? {
                Some(unit_price) => lines.push(CheckoutLine {
                    item_id,
                    quantity,
                    unit_price,
                }),
                None => shortfalls.push(Shortfall::not_found(item_id, quantity)),
            }
        }

        let created_at = Utc::now();
        let session = CheckoutSession {
            checkout_ref: CheckoutRef::new(),
            holder_id,
            shipping_address,
            lines,
            created_at,
            expires_at: created_at + self.config.reservation_ttl,
        };
        self.ledger.open_checkout(&session).await?;

        let mut ledger_error = None;
        for line in &session.lines {
            match self.ledger.try_reserve(&session.reservation_for(line)).await {
                Ok(ReserveOutcome::Reserved) => {}
                Ok(ReserveOutcome::NotFound) => {
                    shortfalls.push(Shortfall::not_found(line.item_id.clone(), line.quantity));
                }
                Ok(ReserveOutcome::Insufficient { available }) => {
                    shortfalls.push(Shortfall::insufficient(
                        line.item_id.clone(),
                        line.quantity,
                        available,
                    ));
                }
                Err(e) => {
                    ledger_error = Some(e);
                    break;
                }
            }
        }

        if ledger_error.is_some() || !shortfalls.is_empty() {
            self.unwind(&session).await;
            metrics::counter!("checkout_reserve_total", "outcome" => "rejected").increment(1);
            metrics::histogram!("checkout_reserve_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            if let Some(e) = ledger_error {
                return Err(e.into());
            }
            tracing::info!(
                checkout_ref = %session.checkout_ref,
                shortfalls = shortfalls.len(),
                "reservation rejected"
            );
            return Err(CheckoutError::InsufficientStock { shortfalls });
        }

        metrics::counter!("checkout_reserve_total", "outcome" => "reserved").increment(1);
        metrics::histogram!("checkout_reserve_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::info!(
            checkout_ref = %session.checkout_ref,
            expires_at = %session.expires_at,
            "cart reserved"
        );

        Ok(CheckoutHold {
            checkout_ref: session.checkout_ref,
            total: session.total(),
            expires_at: session.expires_at,
            lines: session.lines,
        })
    }

    /// Converts the checkout's holds into a stock deduction and an order.
    ///
    /// A checkout that was already confirmed returns `AlreadyConfirmed`. A
    /// checkout that was released, or never existed, is
    /// `UnknownCheckoutRef` and leaves the ledger untouched.
    #[tracing::instrument(skip(self))]
    pub async fn confirm(&self, checkout_ref: CheckoutRef) -> Result<ConfirmOutcome> {
        let Some(session) = self.ledger.claim_checkout(checkout_ref).await? else {
            return match self.orders.find_by_checkout(checkout_ref).await? {
                Some(order) => {
                    metrics::counter!("checkout_confirm_total", "outcome" => "already_confirmed")
                        .increment(1);
                    tracing::debug!(order_id = %order.order_id, "checkout already confirmed");
                    Ok(ConfirmOutcome::AlreadyConfirmed(order))
                }
                None => {
                    metrics::counter!("checkout_confirm_total", "outcome" => "unknown")
                        .increment(1);
                    Err(CheckoutError::UnknownCheckoutRef(checkout_ref))
                }
            };
        };

        let mut confirmed = Vec::with_capacity(session.lines.len());
        let mut failed = Vec::new();
        for line in &session.lines {
            match self
                .ledger
                .confirm_reserved(&line.item_id, checkout_ref)
                .await
            {
                Ok(Some(_)) => confirmed.push(line.item_id.clone()),
                Ok(None) => failed.push(ConfirmFailure {
                    item_id: line.item_id.clone(),
                    reason: "no active hold".to_string(),
                }),
                Err(e) => failed.push(ConfirmFailure {
                    item_id: line.item_id.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        // Payment is already captured here, so deducted lines stay deducted.
        if !failed.is_empty() {
            metrics::counter!("checkout_reconciliation_required_total").increment(1);
            metrics::counter!("checkout_confirm_total", "outcome" => "partial").increment(1);
            tracing::error!(
                %checkout_ref,
                holder_id = %session.holder_id,
                confirmed = ?confirmed,
                failed = ?failed,
                "partial confirm, manual reconciliation required"
            );
            return Err(CheckoutError::ReconciliationRequired {
                checkout_ref,
                confirmed,
                failed,
            });
        }

        let order = match self.orders.create_order(NewOrder::from(session)).await {
            Ok(order) => order,
            Err(e) => {
                metrics::counter!("checkout_reconciliation_required_total").increment(1);
                tracing::error!(
                    %checkout_ref,
                    error = %e,
                    "stock deducted but order record failed, manual reconciliation required"
                );
                return Err(e);
            }
        };

        metrics::counter!("checkout_confirm_total", "outcome" => "confirmed").increment(1);
        tracing::info!(order_id = %order.order_id, total = %order.total, "checkout confirmed");
        Ok(ConfirmOutcome::Confirmed(order))
    }

    /// Returns the checkout's holds to availability.
    ///
    /// Safe to call on any reference: already-terminal or unknown checkouts
    /// report `NothingToRelease`. The ledger applies the claim and the line
    /// releases together, so on error the checkout is still open and an
    /// expired one is picked up again by the next sweep.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, checkout_ref: CheckoutRef) -> Result<ReleaseOutcome> {
        let Some(released) = self.ledger.release_checkout(checkout_ref).await? else {
            tracing::debug!("nothing to release");
            return Ok(ReleaseOutcome::NothingToRelease);
        };

        metrics::counter!("checkout_release_total").increment(1);
        tracing::info!(lines = released.len(), "checkout released");
        Ok(ReleaseOutcome::Released { items: released })
    }

    /// Validates the cart and merges repeated items into one line,
    /// preserving first-seen order.
    fn normalize_cart(&self, items: Vec<CartLine>) -> Result<Vec<(ItemId, u32)>> {
        if items.is_empty() {
            return Err(CheckoutError::InvalidCart("cart is empty".to_string()));
        }

        let mut order: Vec<ItemId> = Vec::new();
        let mut quantities: BTreeMap<ItemId, u32> = BTreeMap::new();
        for line in items {
            if line.quantity == 0 {
                return Err(CheckoutError::InvalidCart(format!(
                    "quantity for {} must be at least 1",
                    line.item_id
                )));
            }
            let entry = quantities.entry(line.item_id.clone()).or_insert_with(|| {
                order.push(line.item_id.clone());
                0
            });
            *entry = entry.checked_add(line.quantity).ok_or_else(|| {
                CheckoutError::InvalidCart(format!("quantity for {} is too large", line.item_id))
            })?;
        }

        if order.len() > self.config.max_cart_lines {
            return Err(CheckoutError::InvalidCart(format!(
                "cart has {} lines, limit is {}",
                order.len(),
                self.config.max_cart_lines
            )));
        }

        Ok(order
            .into_iter()
            .map(|item_id| {
                let quantity = quantities.get(&item_id).copied().unwrap_or_default();
                (item_id, quantity)
            })
            .collect())
    }

    /// Drops the session and whatever holds a failed reserve managed to
    /// take. If that fails the session stays open and the sweeper reclaims
    /// it once it expires.
    async fn unwind(&self, session: &CheckoutSession) {
        if let Err(e) = self.ledger.release_checkout(session.checkout_ref).await {
            tracing::warn!(
                checkout_ref = %session.checkout_ref,
                error = %e,
                "unwind failed, leaving holds for the sweeper"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use common::Money;
    use ledger::InMemoryStockLedger;

    use super::*;
    use crate::services::{InMemoryCatalog, InMemoryOrderBook};

    type TestManager = ReservationManager<InMemoryStockLedger, InMemoryCatalog, InMemoryOrderBook>;

    fn manager(max_cart_lines: usize) -> TestManager {
        ReservationManager::new(
            InMemoryStockLedger::new(),
            InMemoryCatalog::new(),
            InMemoryOrderBook::new(),
            ManagerConfig {
                max_cart_lines,
                ..ManagerConfig::default()
            },
        )
    }

    #[test]
    fn test_normalize_merges_duplicates_in_order() {
        let m = manager(50);
        let cart = m
            .normalize_cart(vec![
                CartLine::new("SKU-B", 1),
                CartLine::new("SKU-A", 2),
                CartLine::new("SKU-B", 3),
            ])
            .unwrap();
        assert_eq!(
            cart,
            vec![(ItemId::new("SKU-B"), 4), (ItemId::new("SKU-A"), 2)]
        );
    }

    #[test]
    fn test_normalize_rejects_bad_carts() {
        let m = manager(2);
        assert!(matches!(
            m.normalize_cart(vec![]),
            Err(CheckoutError::InvalidCart(_))
        ));
        assert!(matches!(
            m.normalize_cart(vec![CartLine::new("SKU-A", 0)]),
            Err(CheckoutError::InvalidCart(_))
        ));
        assert!(matches!(
            m.normalize_cart(vec![
                CartLine::new("SKU-A", 1),
                CartLine::new("SKU-B", 1),
                CartLine::new("SKU-C", 1),
            ]),
            Err(CheckoutError::InvalidCart(_))
        ));
        assert!(matches!(
            m.normalize_cart(vec![
                CartLine::new("SKU-A", u32::MAX),
                CartLine::new("SKU-A", 1),
            ]),
            Err(CheckoutError::InvalidCart(_))
        ));
    }

    #[tokio::test]
    async fn test_reserve_uses_catalog_price() {
        let m = manager(50);
        m.ledger.list_item(&ItemId::new("SKU-A"), 5).await.unwrap();
        m.catalog.set_price("SKU-A", Money::from_cents(1250)).await;

        let hold = m
            .reserve(vec![CartLine::new("SKU-A", 2)], HolderId::guest(), None)
            .await
            .unwrap();

        assert_eq!(hold.total.cents(), 2500);
        assert_eq!(hold.lines[0].unit_price.cents(), 1250);
        assert!(hold.expires_at - Utc::now() <= Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_unpriced_item_is_not_found() {
        let m = manager(50);
        m.ledger.list_item(&ItemId::new("SKU-A"), 5).await.unwrap();

        let err = m
            .reserve(vec![CartLine::new("SKU-A", 1)], HolderId::guest(), None)
            .await
            .unwrap_err();

        match err {
            CheckoutError::InsufficientStock { shortfalls } => {
                assert_eq!(shortfalls, vec![Shortfall::not_found(ItemId::new("SKU-A"), 1)]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(m.ledger.open_checkout_count().await, 0);
    }
}
