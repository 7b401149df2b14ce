//! Checkout error types.

use common::{CheckoutRef, ItemId};
use ledger::LedgerError;
use thiserror::Error;

use crate::outcome::{ConfirmFailure, Shortfall};

/// Errors that can occur during reserve, confirm and release.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The cart is empty, too large, or has a zero quantity.
    #[error("Invalid cart: {0}")]
    InvalidCart(String),

    /// One or more lines could not be held. Nothing was reserved.
    #[error("Insufficient stock for {} item(s)", .shortfalls.len())]
    InsufficientStock { shortfalls: Vec<Shortfall> },

    /// No active reservation and no order exist for this reference.
    #[error("Unknown checkout reference: {0}")]
    UnknownCheckoutRef(CheckoutRef),

    /// Confirm deducted some lines but not all. Stock already deducted is
    /// not returned to sale; an operator has to reconcile.
    #[error("Checkout {checkout_ref} requires reconciliation: {} line(s) failed to confirm", .failed.len())]
    ReconciliationRequired {
        checkout_ref: CheckoutRef,
        confirmed: Vec<ItemId>,
        failed: Vec<ConfirmFailure>,
    },

    /// Stock ledger error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Trusted price lookup failed.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Order record could not be written.
    #[error("Order book error: {0}")]
    OrderBook(String),
}

impl CheckoutError {
    /// Returns true for failures that indicate ledger drift and need an
    /// operator rather than a retry.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            CheckoutError::ReconciliationRequired { .. }
                | CheckoutError::Ledger(LedgerError::InvariantViolation { .. })
        )
    }
}

/// Convenience type alias for checkout results.
pub type Result<T> = std::result::Result<T, CheckoutError>;
