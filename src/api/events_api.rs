//! Event feed and snapshot endpoints: the surfaces the Store tier
//! converges from.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;

use super::{ApiError, CentralState};
use crate::inventory::event_log::{EventBatch, MAX_FETCH_LIMIT, MAX_WAIT_SECS};
use crate::models::{EventFeedResponse, SnapshotResponse};

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub offset: u64,
    pub limit: Option<usize>,
    pub wait: Option<u64>,
}

const DEFAULT_LIMIT: usize = 100;

/// GET /api/v1/events?offset=&limit=&wait=
///
/// With `wait > 0` and no events at `offset`, the handler parks on the log's
/// waiter list and re-fetches after wakeup, so pollers see new events within
/// their wait budget instead of spinning.
pub async fn get_events(
    State(state): State<CentralState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventFeedResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_FETCH_LIMIT);
    let wait_secs = query.wait.unwrap_or(0).min(MAX_WAIT_SECS);

    let batch = fetch(&state, query.offset, limit)?;
    if batch.events.is_empty() && wait_secs > 0 {
        state
            .events
            .wait_for(query.offset, Duration::from_secs(wait_secs))
            .await;
        let batch = fetch(&state, query.offset, limit)?;
        return Ok(Json(respond(batch)));
    }

    Ok(Json(respond(batch)))
}

fn fetch(state: &CentralState, offset: u64, limit: usize) -> Result<EventBatch, ApiError> {
    state
        .events
        .fetch(offset, limit)
        .map_err(|gone| ApiError::gone(gone.to_string()))
}

fn respond(batch: EventBatch) -> EventFeedResponse {
    EventFeedResponse {
        count: batch.events.len(),
        events: batch.events,
        next_offset: batch.next_offset,
        has_more: batch.has_more,
    }
}

/// GET /api/v1/snapshot
///
/// Full product map plus the offset it was captured at; a Store loads the
/// map and resumes polling from exactly that offset.
pub async fn get_snapshot(State(state): State<CentralState>) -> Json<SnapshotResponse> {
    let (products, event_offset) = state.store.snapshot();
    Json(SnapshotResponse {
        total_products: products.len() as u64,
        products,
        event_offset,
        timestamp: Utc::now(),
    })
}
