use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CheckoutRef, PaymentRef};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::error::{PaymentError, Result};
use crate::idempotency::{ConfirmResult, IdempotencyLedger, IdempotencyRecord, InsertOutcome};

/// PostgreSQL-backed idempotency ledger.
///
/// The primary key on `payment_ref` makes insert-if-absent atomic across
/// replicas.
#[derive(Clone)]
pub struct PostgresIdempotencyLedger {
    pool: PgPool,
}

impl PostgresIdempotencyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: PgRow) -> Result<IdempotencyRecord> {
        let confirm_result: serde_json::Value = row.try_get("confirm_result")?;
        Ok(IdempotencyRecord {
            payment_ref: PaymentRef::new(row.try_get::<String, _>("payment_ref")?),
            checkout_ref: CheckoutRef::from_uuid(row.try_get::<Uuid, _>("checkout_ref")?),
            verified_at: row.try_get("verified_at")?,
            confirm_result: serde_json::from_value(confirm_result)?,
        })
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresIdempotencyLedger {
    async fn get(&self, payment_ref: &PaymentRef) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT payment_ref, checkout_ref, verified_at, confirm_result
            FROM idempotency_records
            WHERE payment_ref = $1
            "#,
        )
        .bind(payment_ref.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<InsertOutcome> {
        let confirm_result = serde_json::to_value(&record.confirm_result)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (payment_ref, checkout_ref, verified_at, confirm_result)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (payment_ref) DO NOTHING
            "#,
        )
        .bind(record.payment_ref.as_str())
        .bind(record.checkout_ref.as_uuid())
        .bind(record.verified_at)
        .bind(confirm_result)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            return Ok(InsertOutcome::Inserted);
        }

        let existing = self.get(&record.payment_ref).await?.ok_or_else(|| {
            PaymentError::Storage(format!(
                "record for {} conflicted but is gone",
                record.payment_ref
            ))
        })?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn complete(&self, payment_ref: &PaymentRef, result: &ConfirmResult) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_records SET confirm_result = $2
            WHERE payment_ref = $1
              AND confirm_result->>'status' NOT IN ('confirmed', 'already_confirmed')
            "#,
        )
        .bind(payment_ref.as_str())
        .bind(serde_json::to_value(result)?)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE verified_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
