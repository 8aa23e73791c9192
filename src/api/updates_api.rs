//! The mutation endpoint: single and batch stock updates.
//!
//! Requests are admitted through the dispatcher; the handler only validates
//! shape (a present idempotency key, a non-empty product id) and translates
//! outcomes to wire results. OCC, idempotent replay, and back-pressure all
//! happen in the engine.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use super::CentralState;
use crate::inventory::store::{UpdateError, UpdateOutcome};
use crate::inventory::UpdateRequest;
use crate::models::{
    BatchSummary, BatchUpdateResponse, UpdateItem, UpdatePayload, UpdateResult,
};

/// POST /api/v1/updates
pub async fn post_updates(
    State(state): State<CentralState>,
    Json(payload): Json<UpdatePayload>,
) -> Response {
    match payload {
        UpdatePayload::Single { store_id, update } => {
            let (status, result) = run_update(&state, &store_id, update).await;
            (status, Json(result)).into_response()
        }
        UpdatePayload::Batch { store_id, updates } => {
            let mut results = Vec::with_capacity(updates.len());
            for update in updates {
                let (_, result) = run_update(&state, &store_id, update).await;
                results.push(result);
            }
            let successful = results.iter().filter(|r| r.applied).count();
            let summary = BatchSummary {
                total_requests: results.len(),
                successful,
                failed: results.len() - successful,
            };
            (StatusCode::OK, Json(BatchUpdateResponse { results, summary })).into_response()
        }
    }
}

async fn run_update(
    state: &CentralState,
    store_id: &str,
    update: UpdateItem,
) -> (StatusCode, UpdateResult) {
    if let Err(reason) = validate(&update) {
        let outcome = UpdateOutcome::Rejected(UpdateError::InvalidRequest { reason });
        return (status_for(&outcome), to_result(&update.product_id, outcome));
    }

    let outcome = state
        .dispatcher
        .submit(UpdateRequest {
            store_id: store_id.to_string(),
            product_id: update.product_id.clone(),
            delta: update.delta,
            version: update.version,
            idempotency_key: update.idempotency_key,
        })
        .await;

    (status_for(&outcome), to_result(&update.product_id, outcome))
}

fn validate(update: &UpdateItem) -> Result<(), String> {
    if update.product_id.trim().is_empty() {
        return Err("productId is required".into());
    }
    if update.idempotency_key.trim().is_empty() {
        return Err("idempotencyKey is required".into());
    }
    Ok(())
}

/// HTTP status for one outcome: 200 applied, 409 conflict, 404 missing,
/// 400 invalid/insufficient, 503 queue-full, 500 timeout/internal.
pub fn status_for(outcome: &UpdateOutcome) -> StatusCode {
    match outcome {
        UpdateOutcome::Applied(_) => StatusCode::OK,
        UpdateOutcome::Rejected(err) => match err {
            UpdateError::VersionConflict { .. } => StatusCode::CONFLICT,
            UpdateError::ProductNotFound { .. } => StatusCode::NOT_FOUND,
            UpdateError::InvalidDelta { .. }
            | UpdateError::InsufficientInventory { .. }
            | UpdateError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            UpdateError::BackpressureTimeout => StatusCode::SERVICE_UNAVAILABLE,
            UpdateError::Timeout | UpdateError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        },
    }
}

/// Translate an engine outcome to the wire result body. Version conflicts
/// carry the current version and quantity so the client can retry.
pub fn to_result(product_id: &str, outcome: UpdateOutcome) -> UpdateResult {
    match outcome {
        UpdateOutcome::Applied(applied) => UpdateResult {
            product_id: applied.product_id,
            applied: true,
            new_quantity: Some(applied.new_quantity),
            new_version: Some(applied.new_version),
            last_updated: Some(applied.last_updated),
            error_type: None,
            error_message: None,
        },
        UpdateOutcome::Rejected(err) => {
            let (new_quantity, new_version) = match &err {
                UpdateError::VersionConflict {
                    current_version,
                    current_available,
                } => (Some(*current_available), Some(*current_version)),
                _ => (None, None),
            };
            UpdateResult {
                product_id: product_id.to_string(),
                applied: false,
                new_quantity,
                new_version,
                last_updated: None,
                error_type: Some(err.kind().to_string()),
                error_message: Some(err.to_string()),
            }
        }
    }
}
