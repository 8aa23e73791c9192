//! Store node HTTP surface.
//!
//! Reads come straight from the local mirror and never touch Central;
//! mutations are proxied to Central with the idempotency key namespaced by
//! store id, then written through to the mirror on success.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::warn;

use super::cache::StoreCache;
use super::central_client::CentralClient;
use super::replication::ReplicationEngine;
use crate::api::ApiError;
use crate::middleware::{api_key_middleware, request_logging, ApiKeyGate};
use crate::models::{Product, UpdateItem, UpdatePayload, UpdateResult};

/// Shared state injected into every Store handler.
#[derive(Clone)]
pub struct StoreState {
    pub cache: Arc<StoreCache>,
    pub replication: Arc<ReplicationEngine>,
    pub central: Arc<CentralClient>,
    pub store_id: String,
    pub started_at: DateTime<Utc>,
}

/// Assemble the Store router: `/health` open, `/api/v1` behind the key gate.
pub fn build_router(state: StoreState, gate: ApiKeyGate) -> Router {
    let protected = Router::new()
        .route("/products", get(list_products))
        .route("/products/:id", get(get_product))
        .route("/updates", post(post_updates))
        .route("/sync/status", get(sync_status))
        .route_layer(middleware::from_fn_with_state(gate, api_key_middleware))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .nest("/api/v1", protected)
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_logging))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalListResponse {
    pub items: Vec<Product>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub last_event_offset: u64,
    pub last_sync_time: DateTime<Utc>,
}

async fn get_product(
    State(state): State<StoreState>,
    Path(product_id): Path<String>,
) -> Result<Json<Product>, ApiError> {
    state
        .cache
        .get(&product_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("product {product_id} not found")))
}

async fn list_products(
    State(state): State<StoreState>,
    Query(query): Query<ListQuery>,
) -> Json<LocalListResponse> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let page = state.cache.list(query.cursor.as_deref(), limit);
    Json(LocalListResponse {
        items: page.items,
        next_cursor: page.next_cursor,
        last_event_offset: page.last_event_offset,
        last_sync_time: page.last_sync_time,
    })
}

/// POST /api/v1/updates, proxied to Central.
///
/// Keys are namespaced `"<storeId>-<originalKey>"` before forwarding so two
/// stores reusing the same client key can never collide in Central's
/// idempotency cache.
async fn post_updates(
    State(state): State<StoreState>,
    Json(payload): Json<UpdatePayload>,
) -> Response {
    match payload {
        UpdatePayload::Single { update, .. } => {
            if update.idempotency_key.trim().is_empty() {
                return invalid_key_response(&update.product_id).into_response();
            }
            let namespaced = namespace_key(&state.store_id, update);

            match state.central.push_single(&state.store_id, namespaced).await {
                Ok((status, result)) => {
                    if result.applied {
                        state.cache.apply_update_result(&result);
                    }
                    (status, Json(result)).into_response()
                }
                Err(e) => upstream_error(&e).into_response(),
            }
        }
        UpdatePayload::Batch { updates, .. } => {
            if let Some(bad) = updates
                .iter()
                .find(|u| u.idempotency_key.trim().is_empty())
            {
                return invalid_key_response(&bad.product_id).into_response();
            }
            let namespaced: Vec<UpdateItem> = updates
                .into_iter()
                .map(|u| namespace_key(&state.store_id, u))
                .collect();

            match state.central.push_batch(&state.store_id, namespaced).await {
                Ok((status, response)) => {
                    for result in response.results.iter().filter(|r| r.applied) {
                        state.cache.apply_update_result(result);
                    }
                    (status, Json(response)).into_response()
                }
                Err(e) => upstream_error(&e).into_response(),
            }
        }
    }
}

async fn sync_status(State(state): State<StoreState>) -> Json<serde_json::Value> {
    let status = state.replication.status();
    Json(json!({
        "storeId": state.store_id,
        "sync": status,
        "products": state.cache.len(),
    }))
}

async fn health(State(state): State<StoreState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "store",
        "storeId": state.store_id,
        "phase": state.replication.phase(),
        "products": state.cache.len(),
        "lastEventOffset": state.cache.last_event_offset(),
        "uptimeSecs": (Utc::now() - state.started_at).num_seconds(),
    }))
}

fn namespace_key(store_id: &str, update: UpdateItem) -> UpdateItem {
    UpdateItem {
        idempotency_key: format!("{store_id}-{}", update.idempotency_key),
        ..update
    }
}

fn invalid_key_response(product_id: &str) -> (StatusCode, Json<UpdateResult>) {
    (
        StatusCode::BAD_REQUEST,
        Json(UpdateResult {
            product_id: product_id.to_string(),
            applied: false,
            new_quantity: None,
            new_version: None,
            last_updated: None,
            error_type: Some("invalid_request".to_string()),
            error_message: Some("idempotencyKey is required".to_string()),
        }),
    )
}

fn upstream_error(error: &anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %error, "proxying update to central failed");
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "errorType": "internal_error",
            "errorMessage": "central is unreachable, retry with the same idempotency key",
        })),
    )
}
