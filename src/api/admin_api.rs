//! Admin CRUD over the catalog, batch request/response shaped.
//!
//! Admin paths bypass the dispatcher (no idempotency keys, no OCC version
//! check) but still serialize per product and emit events like any other
//! mutation.

use axum::extract::State;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use super::CentralState;
use crate::inventory::store::{AdminError, AppliedUpdate, NewProduct, ProductPatch};
use crate::models::BatchSummary;

#[derive(Debug, Deserialize)]
pub struct AdminCreateRequest {
    pub products: Vec<NewProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSetItem {
    pub product_id: String,
    #[serde(flatten)]
    pub patch: ProductPatch,
}

#[derive(Debug, Deserialize)]
pub struct AdminSetRequest {
    pub updates: Vec<AdminSetItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminDeleteRequest {
    pub product_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminItemResult {
    pub product_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminBatchResponse {
    pub results: Vec<AdminItemResult>,
    pub summary: BatchSummary,
}

/// POST /api/v1/admin/products
pub async fn admin_create(
    State(state): State<CentralState>,
    Json(request): Json<AdminCreateRequest>,
) -> Json<AdminBatchResponse> {
    let results = request
        .products
        .into_iter()
        .map(|product| {
            let product_id = product.product_id.clone();
            item_result(product_id, state.store.admin_create(product))
        })
        .collect();
    Json(finish(results))
}

/// PUT /api/v1/admin/products
pub async fn admin_set(
    State(state): State<CentralState>,
    Json(request): Json<AdminSetRequest>,
) -> Json<AdminBatchResponse> {
    let results = request
        .updates
        .into_iter()
        .map(|item| {
            let outcome = state.store.admin_set(&item.product_id, item.patch);
            item_result(item.product_id, outcome)
        })
        .collect();
    Json(finish(results))
}

/// DELETE /api/v1/admin/products
pub async fn admin_delete(
    State(state): State<CentralState>,
    Json(request): Json<AdminDeleteRequest>,
) -> Json<AdminBatchResponse> {
    let results = request
        .product_ids
        .into_iter()
        .map(|product_id| {
            let outcome = state.store.admin_delete(&product_id);
            item_result(product_id, outcome)
        })
        .collect();
    Json(finish(results))
}

fn item_result(product_id: String, outcome: Result<AppliedUpdate, AdminError>) -> AdminItemResult {
    match outcome {
        Ok(applied) => AdminItemResult {
            product_id,
            success: true,
            new_version: Some(applied.new_version),
            error_type: None,
            error_message: None,
        },
        Err(err) => AdminItemResult {
            product_id,
            success: false,
            new_version: None,
            error_type: Some(err.kind().to_string()),
            error_message: Some(err.to_string()),
        },
    }
}

fn finish(results: Vec<AdminItemResult>) -> AdminBatchResponse {
    let successful = results.iter().filter(|r| r.success).count();
    let summary = BatchSummary {
        total_requests: results.len(),
        successful,
        failed: results.len() - successful,
    };
    AdminBatchResponse { results, summary }
}
