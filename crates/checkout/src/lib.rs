//! Reservation manager for the checkout engine.
//!
//! A checkout moves through:
//! ```text
//! NO_RESERVATION ──reserve──► ACTIVE ──┬──confirm──► CONFIRMED
//!                                      └──release──► RELEASED
//! ```
//! Reserve is all-or-nothing across cart lines. Confirm and release race
//! freely (late webhook vs. expiry sweep); the first to claim the checkout
//! session wins and the other observes "nothing to do".

pub mod error;
pub mod manager;
pub mod outcome;
pub mod services;
pub mod sweeper;

pub use error::CheckoutError;
pub use manager::{ManagerConfig, ReservationManager};
pub use outcome::{
    CartLine, CheckoutHold, ConfirmFailure, ConfirmOutcome, ReleaseOutcome, Shortfall,
    ShortfallReason,
};
pub use services::{Catalog, InMemoryCatalog, InMemoryOrderBook, NewOrder, Order, OrderBook};
pub use sweeper::{ExpirySweeper, SweepHook, SweepReport, SweeperConfig};
