use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{CheckoutRef, CheckoutSession, ItemId, Reservation, ReserveOutcome, Result, StockLevel};

/// Core trait for stock ledger implementations.
///
/// Every mutating method is atomic for a single item: implementations apply
/// the counter change and the reservation record change together, so
/// `reserved_stock` always equals the sum of the item's records.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StockLedger: Send + Sync {
    /// Lists a new item or sets the total of an existing one.
    ///
    /// Fails with `InvariantViolation` if the new total is below what is
    /// currently reserved.
    async fn list_item(&self, item_id: &ItemId, total_stock: u32) -> Result<()>;

    /// Reads the current counters and active reservations of an item.
    async fn stock_level(&self, item_id: &ItemId) -> Result<Option<StockLevel>>;

    /// Holds `reservation.quantity` units if that many are unreserved.
    ///
    /// The availability check and the increment are one conditional update;
    /// concurrent callers for the last unit cannot both succeed.
    async fn try_reserve(&self, reservation: &Reservation) -> Result<ReserveOutcome>;

    /// Removes the checkout's hold on an item and returns its quantity to
    /// availability. Returns `None` when no hold exists, so a repeated call
    /// changes nothing.
    async fn release_reserved(
        &self,
        item_id: &ItemId,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<u32>>;

    /// Converts the checkout's hold on an item into a sale: both
    /// `total_stock` and `reserved_stock` drop by the held quantity.
    ///
    /// Returns `None` when no hold exists. Applies nothing and returns
    /// `InvariantViolation` if the counters would go out of range.
    async fn confirm_reserved(
        &self,
        item_id: &ItemId,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<u32>>;

    /// Records a checkout session. Fails if the reference is already open.
    async fn open_checkout(&self, session: &CheckoutSession) -> Result<()>;

    /// Atomically removes and returns the session. At most one caller ever
    /// receives `Some` for a given reference.
    async fn claim_checkout(&self, checkout_ref: CheckoutRef) -> Result<Option<CheckoutSession>>;

    /// Claims the session and releases every hold it still has, as one
    /// unit. Returns the released `(item, quantity)` pairs, or `None` when
    /// the session was already claimed.
    ///
    /// On error nothing is applied: the session stays open and keeps
    /// showing up in [`expired_checkouts`](Self::expired_checkouts).
    async fn release_checkout(
        &self,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<Vec<(ItemId, u32)>>>;

    /// Returns references of sessions whose deadline is before `now`,
    /// oldest first, at most `limit` of them.
    async fn expired_checkouts(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<CheckoutRef>>;
}
