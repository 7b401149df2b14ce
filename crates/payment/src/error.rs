//! Payment gateway error types.

use checkout::CheckoutError;
use thiserror::Error;

/// Errors that can occur while verifying and applying payment callbacks.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The callback signature does not match. Never retried.
    #[error("Payment signature mismatch")]
    SignatureMismatch,

    /// The callback is authentic but its content is unusable.
    #[error("Malformed payment callback: {0}")]
    MalformedCallback(String),

    /// The payment provider rejected or failed a request.
    #[error("Payment provider error: {0}")]
    Provider(String),

    /// Idempotency ledger storage failed.
    #[error("Idempotency storage error: {0}")]
    Storage(String),

    /// Reserve/confirm/release error.
    #[error("Checkout error: {0}")]
    Checkout(#[from] CheckoutError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for payment results.
pub type Result<T> = std::result::Result<T, PaymentError>;
