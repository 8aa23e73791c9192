//! Central HTTP API.
//!
//! Thin edge over the consistency engine: admission goes through the
//! dispatcher, reads go straight to the store, and the event feed long-polls
//! the log. Handlers return `Result<Json<T>, ApiError>` so every failure is
//! a typed `{errorType, errorMessage}` body.

pub mod admin_api;
pub mod events_api;
pub mod inventory_api;
pub mod routes;
pub mod updates_api;

pub use routes::build_router;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};

use crate::inventory::{EventLog, IdempotencyCache, InventoryStore, UpdateDispatcher, UpdateOutcome};

/// Shared state injected into every Central handler.
#[derive(Clone)]
pub struct CentralState {
    pub store: Arc<InventoryStore>,
    pub events: Arc<EventLog>,
    pub dispatcher: Arc<UpdateDispatcher>,
    pub idempotency: Arc<IdempotencyCache<UpdateOutcome>>,
    pub started_at: DateTime<Utc>,
}

/// Typed API failure carried to the wire as `{errorType, errorMessage}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_type,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error_type: "product_not_found",
            message: message.into(),
        }
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GONE,
            error_type: "offset_gone",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_type: "internal_error",
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.error_type)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            axum::Json(serde_json::json!({
                "errorType": self.error_type,
                "errorMessage": self.message,
            })),
        )
            .into_response()
    }
}
