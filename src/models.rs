use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of change recorded in the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProductCreated,
    ProductUpdated,
    ProductDeleted,
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::ProductCreated => "product_created",
            EventType::ProductUpdated => "product_updated",
            EventType::ProductDeleted => "product_deleted",
        }
    }
}

/// A stock-keeping unit as held by Central and mirrored by Stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub product_id: String,
    pub name: String,
    pub available: u64,
    pub version: u64,
    pub price: f64,
    pub last_updated: DateTime<Utc>,
}

/// Central-side singleton tracking the aggregate state of the catalog.
///
/// `last_offset` trails the event log: after any successful mutation it
/// equals the offset of the event that mutation appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub last_offset: u64,
    pub total_products: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            last_offset: 0,
            total_products: 0,
            last_updated: Utc::now(),
        }
    }
}

/// One record of the append-only change feed.
///
/// `data` carries the full product snapshot after the change; for deletions
/// it is the tombstone's last-known state with the bumped version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub product_id: String,
    pub version: u64,
    pub data: Product,
}

// ---------------------------------------------------------------------------
// Wire payloads shared by the Central API, the Store proxy, and the
// replication client. Kept in one place so both tiers agree byte-for-byte.
// ---------------------------------------------------------------------------

/// A single stock mutation as submitted by a client or a Store proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateItem {
    pub product_id: String,
    pub delta: i64,
    pub version: u64,
    #[serde(default)]
    pub idempotency_key: String,
}

/// Body of `POST /api/v1/updates`: either a single update or a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdatePayload {
    Batch {
        #[serde(rename = "storeId")]
        store_id: String,
        updates: Vec<UpdateItem>,
    },
    Single {
        #[serde(rename = "storeId")]
        store_id: String,
        #[serde(flatten)]
        update: UpdateItem,
    },
}

/// Per-update response body. `applied: true` carries the new quantity and
/// version; rejections carry the typed error (and, for version conflicts,
/// the current quantity/version so the client can retry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub product_id: String,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_quantity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Outcome tallies attached to batch responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total_requests: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateResponse {
    pub results: Vec<UpdateResult>,
    pub summary: BatchSummary,
}

/// Response of `GET /api/v1/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFeedResponse {
    pub events: Vec<Event>,
    pub next_offset: u64,
    pub has_more: bool,
    pub count: usize,
}

/// Response of `GET /api/v1/snapshot`: the full product map plus the event
/// offset the snapshot was taken at. A Store resuming from `event_offset`
/// misses nothing that happened before the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub products: std::collections::HashMap<String, Product>,
    pub event_offset: u64,
    pub total_products: u64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Central node configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct CentralConfig {
    pub port: u16,
    pub api_key: String,
    pub data_path: PathBuf,
    pub events_path: PathBuf,
    pub worker_count: usize,
    pub queue_buffer_size: usize,
    pub idempotency_ttl: Duration,
    pub idempotency_cleanup_interval: Duration,
    pub max_events: usize,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
}

impl CentralConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let api_key = std::env::var("API_KEY").unwrap_or_default();

        let data_path = std::env::var("DATA_PATH")
            .unwrap_or_else(|_| "./data/inventory.json".to_string())
            .into();
        let events_path = std::env::var("EVENTS_PATH")
            .unwrap_or_else(|_| "./data/events.json".to_string())
            .into();

        Ok(Self {
            port,
            api_key,
            data_path,
            events_path,
            worker_count: env_usize("WORKER_COUNT", 4).clamp(1, 64),
            queue_buffer_size: env_usize("QUEUE_BUFFER_SIZE", 200).max(1),
            idempotency_ttl: Duration::from_secs(env_u64("IDEMPOTENCY_TTL_SECS", 86_400)),
            idempotency_cleanup_interval: Duration::from_secs(env_u64(
                "IDEMPOTENCY_CLEANUP_INTERVAL_SECS",
                300,
            )),
            max_events: env_usize("MAX_EVENTS", 10_000).max(4),
            rate_limit_max_requests: env_u64("RATE_LIMIT_MAX_REQUESTS", 300) as u32,
            rate_limit_window: Duration::from_secs(env_u64("RATE_LIMIT_WINDOW_SECS", 60)),
        })
    }
}

/// Store node configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub port: u16,
    pub store_id: String,
    pub api_key: String,
    pub central_url: String,
    pub central_api_key: String,
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
    pub event_wait_timeout_secs: u64,
    pub event_batch_limit: usize,
    pub max_consecutive_failures: u32,
}

impl StoreConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8081".to_string())
            .parse()
            .unwrap_or(8081);

        // A store without a configured identity gets a generated one; the id
        // namespaces idempotency keys, so it must never collide across stores.
        let store_id = std::env::var("STORE_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("store-{}", uuid::Uuid::new_v4().simple()));

        let central_url = std::env::var("CENTRAL_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            port,
            store_id,
            api_key: std::env::var("API_KEY").unwrap_or_default(),
            central_url,
            central_api_key: std::env::var("CENTRAL_API_KEY").unwrap_or_default(),
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "./store-data".to_string())
                .into(),
            sync_interval: Duration::from_secs(env_u64("SYNC_INTERVAL_SECS", 2)),
            event_wait_timeout_secs: env_u64("EVENT_WAIT_TIMEOUT_SECS", 25).min(60),
            event_batch_limit: env_usize("EVENT_BATCH_LIMIT", 100).clamp(1, 1000),
            max_consecutive_failures: env_u64("MAX_CONSECUTIVE_FAILURES", 5) as u32,
        })
    }
}
