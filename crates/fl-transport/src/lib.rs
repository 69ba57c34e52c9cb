//! Transport abstraction consumed by the queue-backed engines.
//!
//! Engines publish to named queues/exchanges and consume with ack/nack
//! semantics. The wire-level broker client is out of scope; `InMemoryBroker`
//! provides the same contract in-process, including dead-letter routing and
//! TTL delay buffers.

pub mod memory;

pub use memory::InMemoryBroker;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fl_common::Result;
use serde_json::Value;
use tokio::sync::oneshot;

/// Options attached to a publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub persistent: bool,
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }
}

/// Where a queue's expired or rejected messages go.
#[derive(Debug, Clone)]
pub struct DeadLetterRoute {
    pub exchange: String,
    pub routing_key: String,
    /// When set, the queue is a delay buffer: every message republishes to
    /// the route after this long.
    pub ttl: Option<std::time::Duration>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    pub redelivered: bool,
}

/// Consumer verdict for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack { requeue: bool },
}

#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Disposition;
}

/// Cancels the associated consumer when dropped or canceled explicitly.
/// Undelivered messages return to the queue.
pub struct ConsumerHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl ConsumerHandle {
    pub(crate) fn new(cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish to `routing_key` directly (empty exchange) or through a bound
    /// exchange.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<()>;

    /// Declare a queue, optionally with a dead-letter route (and TTL for
    /// delay buffers). Redeclaring updates the route.
    async fn declare_queue(&self, queue: &str, dead_letter: Option<DeadLetterRoute>) -> Result<()>;

    /// Bind `(exchange, routing_key)` to a queue.
    async fn bind(&self, exchange: &str, routing_key: &str, queue: &str) -> Result<()>;

    /// Attach the single consumer for a queue.
    async fn consume(&self, queue: &str, handler: Arc<dyn ConsumeHandler>)
        -> Result<ConsumerHandle>;

    /// Messages currently held by the queue (buffered, in delay, or awaiting
    /// a consumer verdict).
    fn queue_depth(&self, queue: &str) -> usize;
}

/// Fault-injection hooks for simulated outages. Kept off [`Transport`] so
/// engine logic cannot depend on them.
pub trait TransportControl: Send + Sync {
    fn set_down(&self, down: bool);
    fn is_down(&self) -> bool;
}
