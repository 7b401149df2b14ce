//! Records held by the stock ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CheckoutRef, HolderId, ItemId, Money};

/// A time-bounded hold on stock for one item within one checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub checkout_ref: CheckoutRef,
    pub holder_id: HolderId,
    pub item_id: ItemId,
    pub quantity: u32,
    /// Trusted unit price captured when the hold was taken.
    pub unit_price: Money,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Returns true once the deadline has strictly passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// One cart line inside a checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutLine {
    pub item_id: ItemId,
    pub quantity: u32,
    pub unit_price: Money,
}

impl CheckoutLine {
    /// Returns quantity * unit_price.
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// Header that groups the holds of one checkout attempt.
///
/// A session is written before any counter moves and is removed by exactly
/// one terminal transition through [`crate::StockLedger::claim_checkout`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub checkout_ref: CheckoutRef,
    pub holder_id: HolderId,
    pub shipping_address: Option<String>,
    pub lines: Vec<CheckoutLine>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CheckoutSession {
    /// Sum of all line totals.
    pub fn total(&self) -> Money {
        self.lines.iter().map(CheckoutLine::line_total).sum()
    }

    /// Builds the reservation record that backs the given line.
    pub fn reservation_for(&self, line: &CheckoutLine) -> Reservation {
        Reservation {
            checkout_ref: self.checkout_ref,
            holder_id: self.holder_id.clone(),
            item_id: line.item_id.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Result of an attempt to hold stock on a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The hold was taken and the record embedded.
    Reserved,
    /// No such item is listed.
    NotFound,
    /// Not enough unreserved stock; `available` is what was free at the time.
    Insufficient { available: u32 },
}

impl ReserveOutcome {
    pub fn is_reserved(&self) -> bool {
        matches!(self, ReserveOutcome::Reserved)
    }
}

/// Point-in-time read of an item's counters and active holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub item_id: ItemId,
    pub total_stock: u32,
    pub reserved_stock: u32,
    pub reservations: Vec<Reservation>,
}

impl StockLevel {
    /// Units that can still be reserved.
    pub fn available(&self) -> u32 {
        self.total_stock.saturating_sub(self.reserved_stock)
    }

    /// Sum of quantities across the embedded reservation records.
    pub fn held(&self) -> u32 {
        self.reservations.iter().map(|r| r.quantity).sum()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn session() -> CheckoutSession {
        let now = Utc::now();
        CheckoutSession {
            checkout_ref: CheckoutRef::new(),
            holder_id: HolderId::guest(),
            shipping_address: None,
            lines: vec![
                CheckoutLine {
                    item_id: ItemId::new("SKU-001"),
                    quantity: 2,
                    unit_price: Money::from_cents(1000),
                },
                CheckoutLine {
                    item_id: ItemId::new("SKU-002"),
                    quantity: 1,
                    unit_price: Money::from_cents(2500),
                },
            ],
            created_at: now,
            expires_at: now + Duration::minutes(10),
        }
    }

    #[test]
    fn session_total_sums_lines() {
        assert_eq!(session().total().cents(), 4500);
    }

    #[test]
    fn reservation_for_copies_session_header() {
        let s = session();
        let r = s.reservation_for(&s.lines[1]);
        assert_eq!(r.checkout_ref, s.checkout_ref);
        assert_eq!(r.item_id.as_str(), "SKU-002");
        assert_eq!(r.expires_at, s.expires_at);
    }

    #[test]
    fn reservation_expiry_is_strict() {
        let s = session();
        let r = s.reservation_for(&s.lines[0]);
        assert!(!r.is_expired(r.expires_at));
        assert!(r.is_expired(r.expires_at + Duration::seconds(1)));
    }
}
