//! Command/query facade over the store and the relay.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fl_common::{new_id, Result};
use fl_transport::{Transport, TransportControl};
use tracing::info;

use crate::repository::{CreateOrder, OrderRecord, OutboxEntry, OutboxStatus, OutboxStore};
use crate::{OutboxRelay, PublishedMessage, RelayStats};

pub const ORDER_EVENTS_TOPIC: &str = "orders.events";

pub struct OutboxService {
    store: Arc<dyn OutboxStore>,
    relay: OutboxRelay,
    control: Arc<dyn TransportControl>,
}

impl OutboxService {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn Transport>,
        control: Arc<dyn TransportControl>,
        poll_interval: Duration,
    ) -> Self {
        let relay = OutboxRelay::new(store.clone(), transport, poll_interval, 100);
        Self {
            store,
            relay,
            control,
        }
    }

    /// Commit an order and its publish intent in one atomic unit.
    pub async fn create_order(&self, dto: CreateOrder) -> Result<(OrderRecord, OutboxEntry)> {
        let now = Utc::now();
        let order = OrderRecord {
            id: new_id(),
            customer: dto.customer.clone(),
            item: dto.item.clone(),
            quantity: dto.quantity,
            total_cents: dto.total_cents,
            created_at: now,
        };
        let entry = OutboxEntry {
            id: new_id(),
            related_record_id: order.id.clone(),
            topic: ORDER_EVENTS_TOPIC.to_string(),
            payload: serde_json::json!({
                "type": "order.created",
                "orderId": order.id,
                "customer": order.customer,
                "item": order.item,
                "quantity": order.quantity,
                "totalCents": order.total_cents,
            }),
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at: now,
            published_at: None,
            last_error: None,
        };
        self.store.insert_pair(order.clone(), entry.clone()).await?;
        info!(order_id = %order.id, entry_id = %entry.id, "Order and outbox entry committed");
        Ok((order, entry))
    }

    pub async fn create_order_batch(
        &self,
        count: usize,
        dto: CreateOrder,
    ) -> Result<Vec<(OrderRecord, OutboxEntry)>> {
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            pairs.push(self.create_order(dto.clone()).await?);
        }
        Ok(pairs)
    }

    pub fn start_relay(&self) {
        self.relay.start();
    }

    pub fn stop_relay(&self) {
        self.relay.stop();
    }

    /// Simulation hook; does not touch the write path.
    pub fn set_broker_down(&self, down: bool) {
        self.control.set_down(down);
    }

    pub async fn orders(&self) -> Vec<OrderRecord> {
        self.store.orders().await.unwrap_or_default()
    }

    pub async fn outbox(&self) -> Vec<OutboxEntry> {
        self.store.entries().await.unwrap_or_default()
    }

    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.relay.published_messages()
    }

    pub async fn relay_stats(&self) -> RelayStats {
        self.relay.stats().await
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.store.clear().await?;
        self.relay.clear();
        Ok(())
    }
}
