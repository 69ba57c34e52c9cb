//! Store abstraction for the outbox pair.
//!
//! The engine only needs atomic pair insertion and status updates; backing
//! it with a real database is a store-implementation concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fl_common::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

/// The business row half of the pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: String,
    pub customer: String,
    pub item: String,
    pub quantity: u32,
    pub total_cents: u64,
    pub created_at: DateTime<Utc>,
}

/// The publish-intent half of the pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub related_record_id: String,
    pub topic: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrder {
    pub customer: String,
    pub item: String,
    pub quantity: u32,
    pub total_cents: u64,
}

impl Default for CreateOrder {
    fn default() -> Self {
        Self {
            customer: "acme".to_string(),
            item: "widget".to_string(),
            quantity: 1,
            total_cents: 1_999,
        }
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Commit a business record and its outbox entry as one unit; neither is
    /// ever observable without the other.
    async fn insert_pair(&self, order: OrderRecord, entry: OutboxEntry) -> Result<()>;

    /// Pending entries in creation order.
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxEntry>>;

    async fn mark_published(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Count a failed publish attempt; the entry stays pending.
    async fn record_failure(&self, id: &str, error: String) -> Result<()>;

    async fn orders(&self) -> Result<Vec<OrderRecord>>;
    async fn entries(&self) -> Result<Vec<OutboxEntry>>;
    async fn clear(&self) -> Result<()>;
}
