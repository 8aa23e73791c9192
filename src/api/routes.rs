//! Central router assembly.

use std::sync::atomic::Ordering;

use axum::routing::{get, post};
use axum::{extract::State, middleware, response::Json, Router};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::CorsLayer;

use super::{
    admin_api, events_api, inventory_api, updates_api, CentralState,
};
use crate::middleware::{
    api_key_middleware, rate_limit_middleware, request_logging, ApiKeyGate, RateLimiter,
};

/// Assemble the Central router: `/health` is open, everything under
/// `/api/v1` sits behind the rate limiter and the API-key gate.
pub fn build_router(state: CentralState, gate: ApiKeyGate, limiter: RateLimiter) -> Router {
    let protected = Router::new()
        .route(
            "/products",
            get(inventory_api::list_products),
        )
        .route("/products/:id", get(inventory_api::get_product))
        .route("/updates", post(updates_api::post_updates))
        .route("/events", get(events_api::get_events))
        .route("/snapshot", get(events_api::get_snapshot))
        .route(
            "/admin/products",
            post(admin_api::admin_create)
                .put(admin_api::admin_set)
                .delete(admin_api::admin_delete),
        )
        .route("/stats", get(get_stats))
        .route_layer(middleware::from_fn_with_state(gate, api_key_middleware))
        .route_layer(middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .nest("/api/v1", protected)
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_logging))
}

/// GET /health, the open liveness probe.
async fn health(State(state): State<CentralState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "central",
        "products": state.store.len(),
        "eventOffset": state.events.next_offset(),
        "uptimeSecs": (Utc::now() - state.started_at).num_seconds(),
    }))
}

/// GET /api/v1/stats, engine counters for operators.
async fn get_stats(State(state): State<CentralState>) -> Json<serde_json::Value> {
    let d = &state.dispatcher.stats;
    let e = &state.events.stats;
    Json(json!({
        "dispatcher": {
            "submitted": d.submitted.load(Ordering::Relaxed),
            "applied": d.applied.load(Ordering::Relaxed),
            "rejected": d.rejected.load(Ordering::Relaxed),
            "idempotentHits": d.idempotent_hits.load(Ordering::Relaxed),
            "backpressureTimeouts": d.backpressure_timeouts.load(Ordering::Relaxed),
            "processingTimeouts": d.processing_timeouts.load(Ordering::Relaxed),
            "droppedReplies": d.dropped_replies.load(Ordering::Relaxed),
        },
        "eventLog": {
            "nextOffset": state.events.next_offset(),
            "retained": state.events.retained(),
            "oldestRetained": state.events.oldest_retained(),
            "appends": e.appends.load(Ordering::Relaxed),
            "truncated": e.truncated.load(Ordering::Relaxed),
            "persistFailures": e.persist_failures.load(Ordering::Relaxed),
            "waitersFired": e.waiters_fired.load(Ordering::Relaxed),
        },
        "idempotency": {
            "entries": state.idempotency.len(),
        },
        "inventory": {
            "products": state.store.len(),
            "lastOffset": state.store.metadata().last_offset,
        },
    }))
}
