//! Payment confirmation gateway.
//!
//! Two entry paths lead to the same confirm: the buyer's redirect after
//! paying, and the provider's server-to-server webhook. Both verify an
//! HMAC-SHA256 signature before trusting anything, and both go through the
//! idempotency ledger so a payment reference is acted on at most once no
//! matter how many times, or by which path, it arrives.

pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod postgres;
pub mod provider;
pub mod signature;

pub use error::PaymentError;
pub use gateway::{GatewayConfig, PaymentGateway, VerifyOutcome, WebhookEvent, WebhookOutcome};
pub use idempotency::{
    ConfirmResult, IdempotencyLedger, IdempotencyPurge, IdempotencyRecord,
    InMemoryIdempotencyLedger, InsertOutcome,
};
pub use postgres::PostgresIdempotencyLedger;
pub use provider::{PaymentProvider, ProviderOrder, SandboxProvider};
