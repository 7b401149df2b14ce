use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CheckoutLine, CheckoutRef, CheckoutSession, HolderId, ItemId, LedgerError, Money, Reservation,
    ReserveOutcome, Result, StockLevel, store::StockLedger,
};

/// PostgreSQL-backed stock ledger.
///
/// Each primitive runs in its own transaction and guards the counters with
/// a conditional `UPDATE ... WHERE`, so concurrent checkouts are serialized
/// by the row lock on `stock_items`.
#[derive(Clone)]
pub struct PostgresStockLedger {
    pool: PgPool,
}

impl PostgresStockLedger {
    /// Creates a new PostgreSQL stock ledger.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_reservation(row: PgRow) -> Result<Reservation> {
        let item_id = ItemId::new(row.try_get::<String, _>("item_id")?);
        let quantity = to_u32(&item_id, row.try_get("quantity")?)?;
        Ok(Reservation {
            checkout_ref: CheckoutRef::from_uuid(row.try_get::<Uuid, _>("checkout_ref")?),
            holder_id: HolderId::new(row.try_get::<String, _>("holder_id")?),
            item_id,
            quantity,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn row_to_session(row: PgRow) -> Result<CheckoutSession> {
        let lines_json: serde_json::Value = row.try_get("lines")?;
        let lines: Vec<CheckoutLine> = serde_json::from_value(lines_json)?;
        Ok(CheckoutSession {
            checkout_ref: CheckoutRef::from_uuid(row.try_get::<Uuid, _>("checkout_ref")?),
            holder_id: HolderId::new(row.try_get::<String, _>("holder_id")?),
            shipping_address: row.try_get("shipping_address")?,
            lines,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

fn to_u32(item_id: &ItemId, value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| LedgerError::invariant(item_id, format!("counter out of range: {value}")))
}

#[async_trait]
impl StockLedger for PostgresStockLedger {
    async fn list_item(&self, item_id: &ItemId, total_stock: u32) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO stock_items (id, total_stock, reserved_stock)
            VALUES ($1, $2, 0)
            ON CONFLICT (id) DO UPDATE
                SET total_stock = EXCLUDED.total_stock, updated_at = NOW()
                WHERE stock_items.reserved_stock <= EXCLUDED.total_stock
            "#,
        )
        .bind(item_id.as_str())
        .bind(i64::from(total_stock))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::invariant(
                item_id,
                format!("total {total_stock} below reserved"),
            ));
        }
        Ok(())
    }

    async fn stock_level(&self, item_id: &ItemId) -> Result<Option<StockLevel>> {
        let Some(row) =
            sqlx::query("SELECT total_stock, reserved_stock FROM stock_items WHERE id = $1")
                .bind(item_id.as_str())
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };
        let total_stock = to_u32(item_id, row.try_get("total_stock")?)?;
        let reserved_stock = to_u32(item_id, row.try_get("reserved_stock")?)?;

        let rows = sqlx::query(
            r#"
            SELECT checkout_ref, item_id, holder_id, quantity, unit_price_cents, created_at, expires_at
            FROM reservations
            WHERE item_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(item_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        let reservations = rows
            .into_iter()
            .map(Self::row_to_reservation)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(StockLevel {
            item_id: item_id.clone(),
            total_stock,
            reserved_stock,
            reservations,
        }))
    }

    async fn try_reserve(&self, reservation: &Reservation) -> Result<ReserveOutcome> {
        let quantity = i64::from(reservation.quantity);
        let mut tx = self.pool.begin().await?;

        // Conditional increment and record insert in one statement: the
        // record exists iff the counter moved.
        let reserved = sqlx::query(
            r#"
            WITH held AS (
                UPDATE stock_items
                SET reserved_stock = reserved_stock + $2, updated_at = NOW()
                WHERE id = $1 AND total_stock - reserved_stock >= $2
                RETURNING id
            )
            INSERT INTO reservations (checkout_ref, item_id, holder_id, quantity, unit_price_cents, created_at, expires_at)
            SELECT $3, id, $4, $2, $5, $6, $7 FROM held
            "#,
        )
        .bind(reservation.item_id.as_str())
        .bind(quantity)
        .bind(reservation.checkout_ref.as_uuid())
        .bind(reservation.holder_id.as_str())
        .bind(reservation.unit_price.cents())
        .bind(reservation.created_at)
        .bind(reservation.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("reservations_pkey")
            {
                return LedgerError::invariant(
                    &reservation.item_id,
                    format!(
                        "checkout {} already holds this item",
                        reservation.checkout_ref
                    ),
                );
            }
            LedgerError::Database(e)
        })?
        .rows_affected()
            == 1;

        if reserved {
            tx.commit().await?;
            return Ok(ReserveOutcome::Reserved);
        }

        let row = sqlx::query("SELECT total_stock, reserved_stock FROM stock_items WHERE id = $1")
            .bind(reservation.item_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        tx.rollback().await?;

        match row {
            None => Ok(ReserveOutcome::NotFound),
            Some(row) => {
                let total: i64 = row.try_get("total_stock")?;
                let reserved: i64 = row.try_get("reserved_stock")?;
                let available = to_u32(&reservation.item_id, (total - reserved).max(0))?;
                Ok(ReserveOutcome::Insufficient { available })
            }
        }
    }

    async fn release_reserved(
        &self,
        item_id: &ItemId,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<u32>> {
        let mut tx = self.pool.begin().await?;

        let Some(quantity) = sqlx::query_scalar::<_, i64>(
            "DELETE FROM reservations WHERE checkout_ref = $1 AND item_id = $2 RETURNING quantity",
        )
        .bind(checkout_ref.as_uuid())
        .bind(item_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE stock_items
            SET reserved_stock = GREATEST(reserved_stock - $2, 0), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(item_id.as_str())
        .bind(quantity)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(to_u32(item_id, quantity)?))
    }

    async fn confirm_reserved(
        &self,
        item_id: &ItemId,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<u32>> {
        let mut tx = self.pool.begin().await?;

        let Some(quantity) = sqlx::query_scalar::<_, i64>(
            "DELETE FROM reservations WHERE checkout_ref = $1 AND item_id = $2 RETURNING quantity",
        )
        .bind(checkout_ref.as_uuid())
        .bind(item_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        let updated = sqlx::query(
            r#"
            UPDATE stock_items
            SET total_stock = total_stock - $2,
                reserved_stock = reserved_stock - $2,
                updated_at = NOW()
            WHERE id = $1 AND reserved_stock >= $2 AND total_stock >= $2
            "#,
        )
        .bind(item_id.as_str())
        .bind(quantity)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(LedgerError::invariant(
                item_id,
                format!("cannot confirm {quantity}: counters would go negative"),
            ));
        }

        tx.commit().await?;
        Ok(Some(to_u32(item_id, quantity)?))
    }

    async fn open_checkout(&self, session: &CheckoutSession) -> Result<()> {
        let lines_json = serde_json::to_value(&session.lines)?;
        sqlx::query(
            r#"
            INSERT INTO checkout_sessions (checkout_ref, holder_id, shipping_address, lines, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(session.checkout_ref.as_uuid())
        .bind(session.holder_id.as_str())
        .bind(&session.shipping_address)
        .bind(lines_json)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("checkout_sessions_pkey")
            {
                return LedgerError::DuplicateCheckout(session.checkout_ref);
            }
            LedgerError::Database(e)
        })?;
        Ok(())
    }

    async fn claim_checkout(&self, checkout_ref: CheckoutRef) -> Result<Option<CheckoutSession>> {
        let row = sqlx::query(
            r#"
            DELETE FROM checkout_sessions
            WHERE checkout_ref = $1
            RETURNING checkout_ref, holder_id, shipping_address, lines, created_at, expires_at
            "#,
        )
        .bind(checkout_ref.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_session).transpose()
    }

    async fn release_checkout(
        &self,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<Vec<(ItemId, u32)>>> {
        // Dropping `tx` on any error rolls back, so the session survives.
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query(
            r#"
            DELETE FROM checkout_sessions
            WHERE checkout_ref = $1
            RETURNING checkout_ref, holder_id, shipping_address, lines, created_at, expires_at
            "#,
        )
        .bind(checkout_ref.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };
        let session = Self::row_to_session(row)?;

        let mut released = Vec::with_capacity(session.lines.len());
        for line in &session.lines {
            let Some(quantity) = sqlx::query_scalar::<_, i64>(
                "DELETE FROM reservations WHERE checkout_ref = $1 AND item_id = $2 RETURNING quantity",
            )
            .bind(checkout_ref.as_uuid())
            .bind(line.item_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            else {
                continue;
            };

            sqlx::query(
                r#"
                UPDATE stock_items
                SET reserved_stock = GREATEST(reserved_stock - $2, 0), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(line.item_id.as_str())
            .bind(quantity)
            .execute(&mut *tx)
            .await?;

            released.push((line.item_id.clone(), to_u32(&line.item_id, quantity)?));
        }

        tx.commit().await?;
        Ok(Some(released))
    }

    async fn expired_checkouts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CheckoutRef>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let refs: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT checkout_ref FROM checkout_sessions
            WHERE expires_at < $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(refs.into_iter().map(CheckoutRef::from_uuid).collect())
    }
}
