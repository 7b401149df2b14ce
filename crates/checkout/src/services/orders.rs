//! Order record creation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutRef, HolderId, Money, OrderId};
use ledger::{CheckoutLine, CheckoutSession};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::CheckoutError;

/// A confirmed purchase. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub order_id: OrderId,
    pub checkout_ref: CheckoutRef,
    pub holder_id: HolderId,
    pub lines: Vec<CheckoutLine>,
    pub total: Money,
    pub shipping_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Data needed to record an order for a confirmed checkout.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub checkout_ref: CheckoutRef,
    pub holder_id: HolderId,
    pub lines: Vec<CheckoutLine>,
    pub total: Money,
    pub shipping_address: Option<String>,
}

impl From<CheckoutSession> for NewOrder {
    fn from(session: CheckoutSession) -> Self {
        let total = session.total();
        Self {
            checkout_ref: session.checkout_ref,
            holder_id: session.holder_id,
            lines: session.lines,
            total,
            shipping_address: session.shipping_address,
        }
    }
}

/// Trait for the order subsystem.
#[async_trait]
pub trait OrderBook: Send + Sync {
    /// Records the order for a confirmed checkout. Called only from confirm.
    async fn create_order(&self, new_order: NewOrder) -> Result<Order, CheckoutError>;

    /// Finds the order created for a checkout, if any.
    async fn find_by_checkout(
        &self,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<Order>, CheckoutError>;
}

/// In-memory order book for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderBook {
    orders: Arc<RwLock<HashMap<CheckoutRef, Order>>>,
    fail_on_create: Arc<AtomicBool>,
}

impl InMemoryOrderBook {
    /// Creates a new in-memory order book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the book to fail on the next create calls.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.fail_on_create.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of recorded orders.
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

#[async_trait]
impl OrderBook for InMemoryOrderBook {
    async fn create_order(&self, new_order: NewOrder) -> Result<Order, CheckoutError> {
        if self.fail_on_create.load(Ordering::SeqCst) {
            return Err(CheckoutError::OrderBook(
                "order store unavailable".to_string(),
            ));
        }

        let mut orders = self.orders.write().await;
        let order = orders
            .entry(new_order.checkout_ref)
            .or_insert_with(|| Order {
                order_id: OrderId::new(),
                checkout_ref: new_order.checkout_ref,
                holder_id: new_order.holder_id,
                lines: new_order.lines,
                total: new_order.total,
                shipping_address: new_order.shipping_address,
                created_at: Utc::now(),
            });
        Ok(order.clone())
    }

    async fn find_by_checkout(
        &self,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<Order>, CheckoutError> {
        Ok(self.orders.read().await.get(&checkout_ref).cloned())
    }
}

#[cfg(test)]
mod tests {
    use common::ItemId;

    use super::*;

    fn new_order(checkout_ref: CheckoutRef) -> NewOrder {
        NewOrder {
            checkout_ref,
            holder_id: HolderId::guest(),
            lines: vec![CheckoutLine {
                item_id: ItemId::new("SKU-001"),
                quantity: 2,
                unit_price: Money::from_cents(1000),
            }],
            total: Money::from_cents(2000),
            shipping_address: None,
        }
    }

    #[tokio::test]
    async fn test_one_order_per_checkout() {
        let book = InMemoryOrderBook::new();
        let checkout_ref = CheckoutRef::new();

        let first = book.create_order(new_order(checkout_ref)).await.unwrap();
        let second = book.create_order(new_order(checkout_ref)).await.unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(book.order_count().await, 1);
        assert_eq!(
            book.find_by_checkout(checkout_ref).await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn test_fail_on_create() {
        let book = InMemoryOrderBook::new();
        book.set_fail_on_create(true);

        let result = book.create_order(new_order(CheckoutRef::new())).await;
        assert!(result.is_err());
        assert_eq!(book.order_count().await, 0);
    }
}
