//! Shared identifiers and value types used across the checkout engine.

pub mod money;
pub mod types;

pub use money::Money;
pub use types::{CheckoutRef, HolderId, ItemId, OrderId, PaymentRef};
