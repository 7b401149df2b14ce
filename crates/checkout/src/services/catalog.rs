//! Trusted price lookup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{ItemId, Money};
use tokio::sync::RwLock;

use crate::error::CheckoutError;

/// Source of authoritative prices. Client-supplied prices are never used.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns the current price of an item, or `None` if it is not sold.
    async fn trusted_price(&self, item_id: &ItemId) -> Result<Option<Money>, CheckoutError>;
}

/// In-memory catalog for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    prices: Arc<RwLock<HashMap<ItemId, Money>>>,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or replaces an item's price.
    pub async fn set_price(&self, item_id: impl Into<ItemId>, price: Money) {
        self.prices.write().await.insert(item_id.into(), price);
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn trusted_price(&self, item_id: &ItemId) -> Result<Option<Money>, CheckoutError> {
        Ok(self.prices.read().await.get(item_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_price_lookup() {
        let catalog = InMemoryCatalog::new();
        catalog.set_price("SKU-001", Money::from_cents(1999)).await;

        let price = catalog.trusted_price(&ItemId::new("SKU-001")).await.unwrap();
        assert_eq!(price, Some(Money::from_cents(1999)));

        let missing = catalog.trusted_price(&ItemId::new("SKU-404")).await.unwrap();
        assert_eq!(missing, None);
    }
}
