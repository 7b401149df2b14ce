use thiserror::Error;

use crate::{CheckoutRef, ItemId};

/// Errors that can occur when interacting with the stock ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Applying the operation would break `0 <= reserved <= total` or the
    /// reserved/records balance. Never expected from correct callers.
    #[error("Ledger invariant violation on item {item_id}: {reason}")]
    InvariantViolation { item_id: ItemId, reason: String },

    /// A checkout session with this reference already exists.
    #[error("Checkout already open: {0}")]
    DuplicateCheckout(CheckoutRef),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub(crate) fn invariant(item_id: &ItemId, reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            item_id: item_id.clone(),
            reason: reason.into(),
        }
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
