//! Payment provider client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CheckoutRef, Money};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{PaymentError, Result};

/// An order registered with the payment provider for one checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderOrder {
    /// Provider order reference. Equal to the checkout reference.
    pub order_ref: String,
    pub amount: Money,
    pub currency: String,
}

/// Client for the external payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Registers a payable order for a held checkout.
    async fn create_order(&self, checkout_ref: CheckoutRef, amount: Money)
    -> Result<ProviderOrder>;
}

/// Local provider that accepts every order. Used for development and tests.
#[derive(Debug, Clone)]
pub struct SandboxProvider {
    currency: String,
    orders: Arc<RwLock<HashMap<String, ProviderOrder>>>,
}

impl SandboxProvider {
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            orders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn order(&self, order_ref: &str) -> Option<ProviderOrder> {
        self.orders.read().await.get(order_ref).cloned()
    }
}

impl Default for SandboxProvider {
    fn default() -> Self {
        Self::new("USD")
    }
}

#[async_trait]
impl PaymentProvider for SandboxProvider {
    async fn create_order(
        &self,
        checkout_ref: CheckoutRef,
        amount: Money,
    ) -> Result<ProviderOrder> {
        if amount.is_zero() {
            return Err(PaymentError::Provider(
                "order amount must be positive".to_string(),
            ));
        }

        let order = ProviderOrder {
            order_ref: checkout_ref.to_string(),
            amount,
            currency: self.currency.clone(),
        };
        self.orders
            .write()
            .await
            .insert(order.order_ref.clone(), order.clone());
        tracing::debug!(%checkout_ref, %amount, "sandbox provider order created");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_order_ref_is_checkout_ref() {
        let provider = SandboxProvider::default();
        let checkout_ref = CheckoutRef::new();

        let order = provider
            .create_order(checkout_ref, Money::from_cents(2500))
            .await
            .unwrap();

        assert_eq!(order.order_ref, checkout_ref.to_string());
        assert_eq!(order.currency, "USD");
        assert_eq!(CheckoutRef::parse(&order.order_ref).unwrap(), checkout_ref);
        assert_eq!(provider.order(&order.order_ref).await, Some(order));
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let provider = SandboxProvider::default();
        let result = provider.create_order(CheckoutRef::new(), Money::zero()).await;
        assert!(matches!(result, Err(PaymentError::Provider(_))));
    }
}
