//! Stock level endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ItemId;
use ledger::StockLedger;
use payment::IdempotencyLedger;
use serde::Serialize;

use crate::error::ApiError;
use crate::routes::checkout::AppState;

#[derive(Serialize)]
pub struct StockResponse {
    pub item_id: String,
    pub total_stock: u32,
    pub reserved_stock: u32,
    pub available: u32,
    pub active_holds: usize,
}

/// GET /stock/:item_id — current ledger counters for one item.
#[tracing::instrument(skip(state))]
pub async fn get<L: StockLedger + 'static, I: IdempotencyLedger + 'static>(
    State(state): State<Arc<AppState<L, I>>>,
    Path(item_id): Path<String>,
) -> Result<Json<StockResponse>, ApiError> {
    let item_id = ItemId::new(item_id);
    let level = state
        .manager
        .ledger()
        .stock_level(&item_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Item {item_id} not found")))?;

    Ok(Json(StockResponse {
        item_id: level.item_id.to_string(),
        total_stock: level.total_stock,
        reserved_stock: level.reserved_stock,
        available: level.available(),
        active_holds: level.reservations.len(),
    }))
}
