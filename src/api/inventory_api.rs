//! Read endpoints over the authoritative product map.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

use super::{ApiError, CentralState};
use crate::models::Product;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<Product>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub event_offset: u64,
}

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

/// GET /api/v1/products/:id
pub async fn get_product(
    State(state): State<CentralState>,
    Path(product_id): Path<String>,
) -> Result<Json<Product>, ApiError> {
    state
        .store
        .get(&product_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("product {product_id} not found")))
}

/// GET /api/v1/products?cursor=&limit=
pub async fn list_products(
    State(state): State<CentralState>,
    Query(query): Query<ListQuery>,
) -> Json<ListResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let page = state.store.list(query.cursor.as_deref(), limit);
    Json(ListResponse {
        items: page.items,
        next_cursor: page.next_cursor,
        event_offset: page.event_offset,
    })
}
