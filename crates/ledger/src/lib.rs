//! Stock ledger for the checkout engine.
//!
//! The ledger owns the per-item counters (`total_stock`, `reserved_stock`),
//! the reservation records embedded in each item, and the checkout sessions
//! that group reservations under one `CheckoutRef`. Callers never
//! read-modify-write counters; every mutation goes through a primitive on
//! [`StockLedger`] that applies as a single conditional update.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use common::{CheckoutRef, HolderId, ItemId, Money};
pub use error::{LedgerError, Result};
pub use memory::InMemoryStockLedger;
pub use model::{CheckoutLine, CheckoutSession, Reservation, ReserveOutcome, StockLevel};
pub use postgres::PostgresStockLedger;
pub use store::StockLedger;
