//! Payment idempotency ledger.
//!
//! Every provider payment reference is recorded once, before confirm runs.
//! Whichever path (redirect or webhook) inserts the record first performs
//! the confirm; every later arrival reads the stored result instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use checkout::SweepHook;
use chrono::{DateTime, Duration, Utc};
use common::{CheckoutRef, OrderId, PaymentRef};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

/// What confirm did for a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmResult {
    /// Recorded, confirm not finished yet.
    Pending,
    Confirmed { order_id: OrderId },
    AlreadyConfirmed { order_id: OrderId },
    Failed { reason: String },
}

impl ConfirmResult {
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            ConfirmResult::Confirmed { order_id } | ConfirmResult::AlreadyConfirmed { order_id } => {
                Some(*order_id)
            }
            ConfirmResult::Pending | ConfirmResult::Failed { .. } => None,
        }
    }

    /// Wire label, matching the serialized `status` tag.
    pub fn status(&self) -> &'static str {
        match self {
            ConfirmResult::Pending => "pending",
            ConfirmResult::Confirmed { .. } => "confirmed",
            ConfirmResult::AlreadyConfirmed { .. } => "already_confirmed",
            ConfirmResult::Failed { .. } => "failed",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ConfirmResult::Pending)
    }

    /// A result that produced an order. Once stored it is never replaced.
    pub fn is_success(&self) -> bool {
        self.order_id().is_some()
    }
}

/// One processed payment reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub payment_ref: PaymentRef,
    pub checkout_ref: CheckoutRef,
    pub verified_at: DateTime<Utc>,
    pub confirm_result: ConfirmResult,
}

impl IdempotencyRecord {
    /// A freshly verified payment whose confirm has not run yet.
    pub fn pending(payment_ref: PaymentRef, checkout_ref: CheckoutRef, now: DateTime<Utc>) -> Self {
        Self {
            payment_ref,
            checkout_ref,
            verified_at: now,
            confirm_result: ConfirmResult::Pending,
        }
    }
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The caller owns this payment reference and must run confirm.
    Inserted,
    /// Someone recorded it first.
    Existing(IdempotencyRecord),
}

/// Durable record of processed payment references.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn get(&self, payment_ref: &PaymentRef) -> Result<Option<IdempotencyRecord>>;

    /// Atomically records `record` unless its payment reference is already
    /// present.
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<InsertOutcome>;

    /// Stores the confirm result on an existing record, unless the record
    /// already holds a successful one. Returns whether it was written.
    async fn complete(&self, payment_ref: &PaymentRef, result: &ConfirmResult) -> Result<bool>;

    /// Deletes records verified before `cutoff`. Returns how many went.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-memory idempotency ledger.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyLedger {
    records: Arc<Mutex<HashMap<PaymentRef, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryIdempotencyLedger {
    async fn get(&self, payment_ref: &PaymentRef) -> Result<Option<IdempotencyRecord>> {
        Ok(self.records.lock().await.get(payment_ref).cloned())
    }

    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<InsertOutcome> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&record.payment_ref) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        records.insert(record.payment_ref.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn complete(&self, payment_ref: &PaymentRef, result: &ConfirmResult) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(payment_ref) {
            Some(record) if !record.confirm_result.is_success() => {
                record.confirm_result = result.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.verified_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

/// Sweep hook that drops idempotency records older than the retention
/// window. Provider retries never arrive after that window closes.
pub struct IdempotencyPurge<I> {
    ledger: I,
    retention: Duration,
}

impl<I: IdempotencyLedger> IdempotencyPurge<I> {
    pub fn new(ledger: I, retention: Duration) -> Self {
        Self { ledger, retention }
    }
}

#[async_trait]
impl<I: IdempotencyLedger> SweepHook for IdempotencyPurge<I> {
    fn name(&self) -> &'static str {
        "idempotency_purge"
    }

    async fn after_sweep(
        &self,
        now: DateTime<Utc>,
    ) -> std::result::Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let purged = self.ledger.purge_before(now - self.retention).await?;
        if purged > 0 {
            tracing::debug!(purged, "purged idempotency records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payment_ref: &str, verified_at: DateTime<Utc>) -> IdempotencyRecord {
        IdempotencyRecord::pending(PaymentRef::new(payment_ref), CheckoutRef::new(), verified_at)
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first_record() {
        let ledger = InMemoryIdempotencyLedger::new();
        let first = record("pay_1", Utc::now());
        let second = record("pay_1", Utc::now());

        assert_eq!(
            ledger.insert_if_absent(&first).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            ledger.insert_if_absent(&second).await.unwrap(),
            InsertOutcome::Existing(first.clone())
        );
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_complete_stores_result() {
        let ledger = InMemoryIdempotencyLedger::new();
        let rec = record("pay_1", Utc::now());
        ledger.insert_if_absent(&rec).await.unwrap();

        let order_id = OrderId::new();
        assert!(
            ledger
                .complete(&rec.payment_ref, &ConfirmResult::Confirmed { order_id })
                .await
                .unwrap()
        );

        let stored = ledger.get(&rec.payment_ref).await.unwrap().unwrap();
        assert_eq!(stored.confirm_result.order_id(), Some(order_id));
        assert!(!stored.confirm_result.is_pending());
    }

    #[tokio::test]
    async fn test_failure_never_replaces_confirmed() {
        let ledger = InMemoryIdempotencyLedger::new();
        let rec = record("pay_1", Utc::now());
        ledger.insert_if_absent(&rec).await.unwrap();
        let failed = ConfirmResult::Failed {
            reason: "unknown checkout".to_string(),
        };

        // A failure recorded first is overwritten by the winning confirm.
        assert!(ledger.complete(&rec.payment_ref, &failed).await.unwrap());
        let order_id = OrderId::new();
        let confirmed = ConfirmResult::Confirmed { order_id };
        assert!(ledger.complete(&rec.payment_ref, &confirmed).await.unwrap());

        // A late failure is not.
        assert!(!ledger.complete(&rec.payment_ref, &failed).await.unwrap());
        let stored = ledger.get(&rec.payment_ref).await.unwrap().unwrap();
        assert_eq!(stored.confirm_result, confirmed);

        assert!(
            !ledger
                .complete(&PaymentRef::new("pay_missing"), &failed)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_purge_hook_respects_retention() {
        let ledger = InMemoryIdempotencyLedger::new();
        let now = Utc::now();
        ledger
            .insert_if_absent(&record("old", now - Duration::hours(73)))
            .await
            .unwrap();
        ledger
            .insert_if_absent(&record("fresh", now - Duration::hours(1)))
            .await
            .unwrap();

        let hook = IdempotencyPurge::new(ledger.clone(), Duration::hours(72));
        assert_eq!(hook.after_sweep(now).await.unwrap(), 1);
        assert!(ledger.get(&PaymentRef::new("old")).await.unwrap().is_none());
        assert!(ledger.get(&PaymentRef::new("fresh")).await.unwrap().is_some());
    }

    #[test]
    fn test_confirm_result_wire_format() {
        let json = serde_json::to_value(ConfirmResult::Failed {
            reason: "expired".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(
            ConfirmResult::Failed {
                reason: String::new()
            }
            .status(),
            "failed"
        );
        assert_eq!(json["reason"], "expired");
    }
}
