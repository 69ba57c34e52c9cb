//! In-memory outbox store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fl_common::{BoundedLog, Result};
use parking_lot::Mutex;

use crate::repository::{OrderRecord, OutboxEntry, OutboxStatus, OutboxStore};

const PAIR_CAPACITY: usize = 50;

/// Both tables live behind one mutex; holding it for the whole insert is
/// what makes `insert_pair` atomic to every reader.
pub struct InMemoryOutboxStore {
    tables: Mutex<(BoundedLog<OrderRecord>, BoundedLog<OutboxEntry>)>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new((
                BoundedLog::new(PAIR_CAPACITY),
                BoundedLog::new(PAIR_CAPACITY),
            )),
        }
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert_pair(&self, order: OrderRecord, entry: OutboxEntry) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.0.push(order);
        tables.1.push(entry);
        Ok(())
    }

    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxEntry>> {
        let tables = self.tables.lock();
        Ok(tables
            .1
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock();
        if let Some(entry) = tables.1.iter_mut().find(|e| e.id == id) {
            entry.status = OutboxStatus::Published;
            entry.published_at = Some(at);
            entry.last_error = None;
        }
        Ok(())
    }

    async fn record_failure(&self, id: &str, error: String) -> Result<()> {
        let mut tables = self.tables.lock();
        if let Some(entry) = tables.1.iter_mut().find(|e| e.id == id) {
            entry.retry_count += 1;
            entry.last_error = Some(error);
        }
        Ok(())
    }

    async fn orders(&self) -> Result<Vec<OrderRecord>> {
        Ok(self.tables.lock().0.snapshot())
    }

    async fn entries(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self.tables.lock().1.snapshot())
    }

    async fn clear(&self) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.0.clear();
        tables.1.clear();
        Ok(())
    }
}
