//! Transactional outbox engine.
//!
//! A business write and its event-publish intent commit as one atomic unit;
//! a periodic relay drains pending intents to the transport, tolerating
//! outages by leaving unpublished entries pending for the next poll.

pub mod memory;
pub mod repository;
pub mod service;

pub use memory::InMemoryOutboxStore;
pub use repository::{CreateOrder, OrderRecord, OutboxEntry, OutboxStatus, OutboxStore};
pub use service::{OutboxService, ORDER_EVENTS_TOPIC};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fl_common::{BoundedLog, TaskRegistry};
use fl_transport::{PublishOptions, Transport};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

const PUBLISHED_LOG_CAPACITY: usize = 100;
pub const OUTBOX_ENTRY_ID_HEADER: &str = "outboxEntryId";
pub const RELATED_RECORD_ID_HEADER: &str = "relatedRecordId";

/// A publish the transport confirmed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedMessage {
    pub outbox_entry_id: String,
    pub related_record_id: String,
    pub topic: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub running: bool,
    pub polls: u64,
    pub published_total: u64,
    pub failed_attempts: u64,
    pub pending: usize,
    pub last_poll_at: Option<DateTime<Utc>>,
}

struct RelayShared {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn Transport>,
    batch_size: u32,
    published_log: Mutex<BoundedLog<PublishedMessage>>,
    polls: AtomicU64,
    published_total: AtomicU64,
    failed_attempts: AtomicU64,
    last_poll_at: Mutex<Option<DateTime<Utc>>>,
    running: AtomicBool,
}

impl RelayShared {
    async fn process_batch(&self) -> anyhow::Result<()> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        *self.last_poll_at.lock() = Some(Utc::now());

        let pending = self.store.fetch_pending(self.batch_size).await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "Relaying pending outbox entries");

        for entry in pending {
            let options = PublishOptions::default()
                .with_header(OUTBOX_ENTRY_ID_HEADER, &entry.id)
                .with_header(RELATED_RECORD_ID_HEADER, &entry.related_record_id);

            match self
                .transport
                .publish("", &entry.topic, entry.payload.clone(), options)
                .await
            {
                Ok(()) => {
                    let at = Utc::now();
                    self.store.mark_published(&entry.id, at).await?;
                    self.published_total.fetch_add(1, Ordering::SeqCst);
                    self.published_log.lock().push(PublishedMessage {
                        outbox_entry_id: entry.id.clone(),
                        related_record_id: entry.related_record_id.clone(),
                        topic: entry.topic.clone(),
                        payload: entry.payload.clone(),
                        published_at: at,
                    });
                    debug!(entry_id = %entry.id, "Outbox entry published");
                }
                Err(e) => {
                    // Outage or publish failure: the entry stays pending and
                    // the rest of the batch is still attempted.
                    self.failed_attempts.fetch_add(1, Ordering::SeqCst);
                    self.store.record_failure(&entry.id, e.to_string()).await?;
                    warn!(entry_id = %entry.id, error = %e, "Outbox publish failed, will retry");
                }
            }
        }
        Ok(())
    }
}

/// Periodic poller that drains pending entries to the transport.
pub struct OutboxRelay {
    shared: Arc<RelayShared>,
    poll_interval: Duration,
    tasks: Mutex<Option<TaskRegistry>>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn Transport>,
        poll_interval: Duration,
        batch_size: u32,
    ) -> Self {
        Self {
            shared: Arc::new(RelayShared {
                store,
                transport,
                batch_size,
                published_log: Mutex::new(BoundedLog::new(PUBLISHED_LOG_CAPACITY)),
                polls: AtomicU64::new(0),
                published_total: AtomicU64::new(0),
                failed_attempts: AtomicU64::new(0),
                last_poll_at: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            poll_interval,
            tasks: Mutex::new(None),
        }
    }

    /// Start polling. No-op when already running.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }
        let registry = TaskRegistry::new();
        let shared = self.shared.clone();
        registry.every(self.poll_interval, move || {
            let shared = shared.clone();
            async move { shared.process_batch().await }
        });
        *tasks = Some(registry);
        self.shared.running.store(true, Ordering::SeqCst);
        info!(interval_ms = self.poll_interval.as_millis() as u64, "Outbox relay started");
    }

    /// Cancel the poll task. Idempotent.
    pub fn stop(&self) {
        if let Some(registry) = self.tasks.lock().take() {
            registry.shutdown();
            info!("Outbox relay stopped");
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.shared.published_log.lock().snapshot()
    }

    pub async fn stats(&self) -> RelayStats {
        let entries = self.shared.store.entries().await.unwrap_or_default();
        RelayStats {
            running: self.shared.running.load(Ordering::SeqCst),
            polls: self.shared.polls.load(Ordering::SeqCst),
            published_total: self.shared.published_total.load(Ordering::SeqCst),
            failed_attempts: self.shared.failed_attempts.load(Ordering::SeqCst),
            pending: entries
                .iter()
                .filter(|e| e.status == OutboxStatus::Pending)
                .count(),
            last_poll_at: *self.shared.last_poll_at.lock(),
        }
    }

    /// Reset the published log and counters.
    pub fn clear(&self) {
        self.shared.published_log.lock().clear();
        self.shared.polls.store(0, Ordering::SeqCst);
        self.shared.published_total.store(0, Ordering::SeqCst);
        self.shared.failed_attempts.store(0, Ordering::SeqCst);
        *self.shared.last_poll_at.lock() = None;
    }
}
