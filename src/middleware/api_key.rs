//! API-key gate for the versioned API surface.
//!
//! Every `/api/v1` route requires `X-API-Key` to match the configured key.
//! An empty configured key disables the gate (local development); the
//! binaries warn loudly when that happens.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::warn;

/// Shared gate state: the expected key, empty meaning "open".
#[derive(Clone)]
pub struct ApiKeyGate {
    expected: String,
}

impl ApiKeyGate {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.expected.is_empty()
    }

    fn check(&self, presented: Option<&str>) -> Result<(), ApiKeyError> {
        if self.expected.is_empty() {
            return Ok(());
        }
        match presented {
            None => Err(ApiKeyError::Missing),
            Some(key) if key == self.expected => Ok(()),
            Some(_) => Err(ApiKeyError::Invalid),
        }
    }
}

pub async fn api_key_middleware(
    State(gate): State<ApiKeyGate>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiKeyError> {
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    gate.check(presented).map_err(|e| {
        warn!(path = %request.uri().path(), "rejected request: {e:?}");
        e
    })?;

    Ok(next.run(request).await)
}

#[derive(Debug)]
pub enum ApiKeyError {
    Missing,
    Invalid,
}

impl IntoResponse for ApiKeyError {
    fn into_response(self) -> Response {
        let message = match self {
            ApiKeyError::Missing => "Missing X-API-Key header",
            ApiKeyError::Invalid => "Invalid API key",
        };
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({
                "errorType": "unauthorized",
                "errorMessage": message,
            })),
        )
            .into_response()
    }
}
