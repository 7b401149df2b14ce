use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::{
    CheckoutRef, CheckoutSession, ItemId, LedgerError, Reservation, ReserveOutcome, Result,
    StockLevel, store::StockLedger,
};

#[derive(Debug, Default)]
struct StockItem {
    total_stock: u32,
    reserved_stock: u32,
    reservations: HashMap<CheckoutRef, Reservation>,
}

impl StockItem {
    fn available(&self) -> u32 {
        self.total_stock.saturating_sub(self.reserved_stock)
    }
}

/// In-memory stock ledger.
///
/// Each item sits behind its own mutex, so holds on different items never
/// contend; the item map lock is only written when an item is listed.
#[derive(Clone, Default)]
pub struct InMemoryStockLedger {
    items: Arc<RwLock<HashMap<ItemId, Arc<Mutex<StockItem>>>>>,
    sessions: Arc<Mutex<HashMap<CheckoutRef, CheckoutSession>>>,
}

impl InMemoryStockLedger {
    /// Creates a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of open checkout sessions.
    pub async fn open_checkout_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn item(&self, item_id: &ItemId) -> Option<Arc<Mutex<StockItem>>> {
        self.items.read().await.get(item_id).cloned()
    }

    async fn release_hold(&self, item_id: &ItemId, checkout_ref: CheckoutRef) -> Option<u32> {
        let item = self.item(item_id).await?;
        let mut item = item.lock().await;
        let reservation = item.reservations.remove(&checkout_ref)?;
        item.reserved_stock = item.reserved_stock.saturating_sub(reservation.quantity);
        Some(reservation.quantity)
    }
}

#[async_trait]
impl StockLedger for InMemoryStockLedger {
    async fn list_item(&self, item_id: &ItemId, total_stock: u32) -> Result<()> {
        let mut items = self.items.write().await;
        match items.get(item_id) {
            Some(existing) => {
                let mut item = existing.lock().await;
                if total_stock < item.reserved_stock {
                    return Err(LedgerError::invariant(
                        item_id,
                        format!(
                            "total {total_stock} below reserved {}",
                            item.reserved_stock
                        ),
                    ));
                }
                item.total_stock = total_stock;
            }
            None => {
                items.insert(
                    item_id.clone(),
                    Arc::new(Mutex::new(StockItem {
                        total_stock,
                        ..StockItem::default()
                    })),
                );
            }
        }
        Ok(())
    }

    async fn stock_level(&self, item_id: &ItemId) -> Result<Option<StockLevel>> {
        let Some(item) = self.item(item_id).await else {
            return Ok(None);
        };
        let item = item.lock().await;
        let mut reservations: Vec<_> = item.reservations.values().cloned().collect();
        reservations.sort_by_key(|r| r.created_at);
        Ok(Some(StockLevel {
            item_id: item_id.clone(),
            total_stock: item.total_stock,
            reserved_stock: item.reserved_stock,
            reservations,
        }))
    }

    async fn try_reserve(&self, reservation: &Reservation) -> Result<ReserveOutcome> {
        let Some(item) = self.item(&reservation.item_id).await else {
            return Ok(ReserveOutcome::NotFound);
        };
        let mut item = item.lock().await;

        if item.reservations.contains_key(&reservation.checkout_ref) {
            return Err(LedgerError::invariant(
                &reservation.item_id,
                format!("checkout {} already holds this item", reservation.checkout_ref),
            ));
        }

        let available = item.available();
        if available < reservation.quantity {
            return Ok(ReserveOutcome::Insufficient { available });
        }

        item.reserved_stock += reservation.quantity;
        item.reservations
            .insert(reservation.checkout_ref, reservation.clone());
        Ok(ReserveOutcome::Reserved)
    }

    async fn release_reserved(
        &self,
        item_id: &ItemId,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<u32>> {
        Ok(self.release_hold(item_id, checkout_ref).await)
    }

    async fn confirm_reserved(
        &self,
        item_id: &ItemId,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<u32>> {
        let Some(item) = self.item(item_id).await else {
            return Ok(None);
        };
        let mut item = item.lock().await;

        let Some(quantity) = item.reservations.get(&checkout_ref).map(|r| r.quantity) else {
            return Ok(None);
        };
        if quantity > item.reserved_stock || quantity > item.total_stock {
            return Err(LedgerError::invariant(
                item_id,
                format!(
                    "cannot confirm {quantity} with total {} and reserved {}",
                    item.total_stock, item.reserved_stock
                ),
            ));
        }

        item.reservations.remove(&checkout_ref);
        item.total_stock -= quantity;
        item.reserved_stock -= quantity;
        Ok(Some(quantity))
    }

    async fn open_checkout(&self, session: &CheckoutSession) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.checkout_ref) {
            return Err(LedgerError::DuplicateCheckout(session.checkout_ref));
        }
        sessions.insert(session.checkout_ref, session.clone());
        Ok(())
    }

    async fn claim_checkout(&self, checkout_ref: CheckoutRef) -> Result<Option<CheckoutSession>> {
        Ok(self.sessions.lock().await.remove(&checkout_ref))
    }

    async fn release_checkout(
        &self,
        checkout_ref: CheckoutRef,
    ) -> Result<Option<Vec<(ItemId, u32)>>> {
        // Holding the session map keeps confirm from claiming mid-release.
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.remove(&checkout_ref) else {
            return Ok(None);
        };

        let mut released = Vec::with_capacity(session.lines.len());
        for line in &session.lines {
            if let Some(quantity) = self.release_hold(&line.item_id, checkout_ref).await {
                released.push((line.item_id.clone(), quantity));
            }
        }
        Ok(Some(released))
    }

    async fn expired_checkouts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CheckoutRef>> {
        let sessions = self.sessions.lock().await;
        let mut expired: Vec<_> = sessions
            .values()
            .filter(|s| s.expires_at < now)
            .map(|s| (s.expires_at, s.checkout_ref))
            .collect();
        expired.sort_by_key(|(expires_at, _)| *expires_at);
        Ok(expired
            .into_iter()
            .take(limit)
            .map(|(_, checkout_ref)| checkout_ref)
            .collect())
    }
}
