//! HTTP client for the Central node.
//!
//! One pooled client per Store process, `X-API-Key` attached as a default
//! header. The `CentralFeed` trait is the seam the replication engine sits
//! on, so tests drive it with an in-memory double instead of a server.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::Client;

use crate::models::{
    BatchUpdateResponse, EventFeedResponse, SnapshotResponse, UpdateItem, UpdatePayload,
    UpdateResult,
};

/// Failure modes of a feed call, as the replication engine sees them.
#[derive(Debug)]
pub enum FeedError {
    /// The requested offset was truncated out of retention (HTTP 410).
    OffsetGone,
    /// Central answered with a non-success status.
    Status { status: u16, body: String },
    /// The request never completed (connect, timeout, decode).
    Transport(String),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::OffsetGone => write!(f, "offset gone, snapshot resync required"),
            FeedError::Status { status, body } => write!(f, "central returned {status}: {body}"),
            FeedError::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for FeedError {}

/// What the replication engine needs from Central.
#[async_trait]
pub trait CentralFeed: Send + Sync {
    async fn fetch_events(
        &self,
        offset: u64,
        limit: usize,
        wait_secs: u64,
    ) -> Result<EventFeedResponse, FeedError>;

    async fn fetch_snapshot(&self) -> Result<SnapshotResponse, FeedError>;
}

pub struct CentralClient {
    client: Client,
    base_url: String,
}

impl CentralClient {
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !api_key.is_empty() {
            headers.insert(
                "x-api-key",
                api_key.parse().context("invalid central API key")?,
            );
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers(headers)
            .build()
            .context("failed to build central client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Forward a single (already key-namespaced) update. Central answers
    /// with an `UpdateResult` body on every single-update status; anything
    /// else (gateway errors, auth failures) is folded into a rejection
    /// result so the proxy always has something well-formed to relay.
    pub async fn push_single(
        &self,
        store_id: &str,
        update: UpdateItem,
    ) -> Result<(StatusCode, UpdateResult)> {
        let product_id = update.product_id.clone();
        let payload = UpdatePayload::Single {
            store_id: store_id.to_string(),
            update,
        };

        let resp = self
            .client
            .post(self.url("/api/v1/updates"))
            .timeout(Duration::from_secs(30))
            .json(&payload)
            .send()
            .await
            .context("POST /api/v1/updates failed")?;

        let status = StatusCode::from_u16(resp.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp.text().await.unwrap_or_default();

        let result = serde_json::from_str::<UpdateResult>(&body).unwrap_or_else(|_| {
            let fallback: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
            UpdateResult {
                product_id,
                applied: false,
                new_quantity: None,
                new_version: None,
                last_updated: None,
                error_type: Some(
                    fallback
                        .get("errorType")
                        .and_then(|v| v.as_str())
                        .unwrap_or("internal_error")
                        .to_string(),
                ),
                error_message: Some(
                    fallback
                        .get("errorMessage")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unexpected central response")
                        .to_string(),
                ),
            }
        });

        Ok((status, result))
    }

    /// Forward a batch of (already key-namespaced) updates.
    pub async fn push_batch(
        &self,
        store_id: &str,
        updates: Vec<UpdateItem>,
    ) -> Result<(StatusCode, BatchUpdateResponse)> {
        let payload = UpdatePayload::Batch {
            store_id: store_id.to_string(),
            updates,
        };

        let resp = self
            .client
            .post(self.url("/api/v1/updates"))
            .timeout(Duration::from_secs(60))
            .json(&payload)
            .send()
            .await
            .context("POST /api/v1/updates (batch) failed")?;

        let status = StatusCode::from_u16(resp.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp
            .json::<BatchUpdateResponse>()
            .await
            .context("failed to parse batch update response")?;
        Ok((status, body))
    }
}

#[async_trait]
impl CentralFeed for CentralClient {
    async fn fetch_events(
        &self,
        offset: u64,
        limit: usize,
        wait_secs: u64,
    ) -> Result<EventFeedResponse, FeedError> {
        // Deadline = long-poll budget + headroom for transfer.
        let deadline = Duration::from_secs(wait_secs + 10);

        let resp = self
            .client
            .get(self.url("/api/v1/events"))
            .timeout(deadline)
            .query(&[
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
                ("wait", wait_secs.to_string()),
            ])
            .send()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::GONE {
            return Err(FeedError::OffsetGone);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FeedError::Status { status, body });
        }

        resp.json::<EventFeedResponse>()
            .await
            .map_err(|e| FeedError::Transport(format!("event feed decode: {e}")))
    }

    async fn fetch_snapshot(&self) -> Result<SnapshotResponse, FeedError> {
        let resp = self
            .client
            .get(self.url("/api/v1/snapshot"))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FeedError::Status { status, body });
        }

        resp.json::<SnapshotResponse>()
            .await
            .map_err(|e| FeedError::Transport(format!("snapshot decode: {e}")))
    }
}
