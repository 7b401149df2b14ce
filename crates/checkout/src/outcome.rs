//! Inputs and results of reservation manager operations.

use chrono::{DateTime, Utc};
use common::{CheckoutRef, ItemId, Money};
use ledger::CheckoutLine;
use serde::{Deserialize, Serialize};

use crate::services::Order;

/// A cart line as submitted by the buyer. Prices are never taken from here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CartLine {
    pub item_id: ItemId,
    pub quantity: u32,
}

impl CartLine {
    pub fn new(item_id: impl Into<ItemId>, quantity: u32) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
        }
    }
}

/// A successful all-or-nothing hold on a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutHold {
    pub checkout_ref: CheckoutRef,
    pub lines: Vec<CheckoutLine>,
    pub total: Money,
    pub expires_at: DateTime<Utc>,
}

/// Why a line could not be held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallReason {
    NotFound,
    Insufficient,
}

/// One line of an itemised reservation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortfall {
    pub item_id: ItemId,
    pub requested: u32,
    /// Units that were free when the attempt failed.
    pub available: u32,
    pub reason: ShortfallReason,
}

impl Shortfall {
    pub fn not_found(item_id: ItemId, requested: u32) -> Self {
        Self {
            item_id,
            requested,
            available: 0,
            reason: ShortfallReason::NotFound,
        }
    }

    pub fn insufficient(item_id: ItemId, requested: u32, available: u32) -> Self {
        Self {
            item_id,
            requested,
            available,
            reason: ShortfallReason::Insufficient,
        }
    }
}

/// A line that could not be converted into a sale during confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmFailure {
    pub item_id: ItemId,
    pub reason: String,
}

/// Result of a confirm call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// This call converted the holds and created the order.
    Confirmed(Order),
    /// An earlier call already confirmed this checkout.
    AlreadyConfirmed(Order),
}

impl ConfirmOutcome {
    pub fn order(&self) -> &Order {
        match self {
            ConfirmOutcome::Confirmed(order) | ConfirmOutcome::AlreadyConfirmed(order) => order,
        }
    }

    pub fn is_first_confirmation(&self) -> bool {
        matches!(self, ConfirmOutcome::Confirmed(_))
    }
}

/// Result of a release call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Holds were returned to availability.
    Released { items: Vec<(ItemId, u32)> },
    /// The checkout was already confirmed, released, or never existed.
    NothingToRelease,
}

impl ReleaseOutcome {
    pub fn released_anything(&self) -> bool {
        matches!(self, ReleaseOutcome::Released { .. })
    }
}
