//! In-memory broker.
//!
//! Single-process stand-in for the wire-level broker: named FIFO queues,
//! exchange bindings, dead-letter routes, TTL delay buffers, and an outage
//! toggle for simulation. One consumer per queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fl_common::{new_id, FaultLineError, Result, TaskRegistry};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    ConsumeHandler, ConsumerHandle, DeadLetterRoute, Delivery, Disposition, PublishOptions,
    Transport, TransportControl,
};

#[derive(Debug, Clone)]
struct QueuedMessage {
    message_id: String,
    payload: Value,
    headers: HashMap<String, String>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    dead_letter: Option<DeadLetterRoute>,
    /// Messages waiting for a consumer to attach.
    pending: VecDeque<QueuedMessage>,
    consumer: Option<mpsc::UnboundedSender<QueuedMessage>>,
    /// Messages held by the queue: buffered, in TTL delay, or awaiting a
    /// consumer verdict.
    depth: usize,
}

struct BrokerInner {
    queues: DashMap<String, QueueState>,
    /// "exchange/routing_key" -> queue
    bindings: DashMap<String, String>,
    down: AtomicBool,
    tasks: TaskRegistry,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: DashMap::new(),
                bindings: DashMap::new(),
                down: AtomicBool::new(false),
                tasks: TaskRegistry::new(),
            }),
        }
    }

    /// Cancel every consumer loop and pending TTL timer.
    pub fn close(&self) {
        self.inner.tasks.shutdown();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerInner {
    fn binding_key(exchange: &str, routing_key: &str) -> String {
        format!("{}/{}", exchange, routing_key)
    }

    fn resolve(&self, exchange: &str, routing_key: &str) -> Result<String> {
        if exchange.is_empty() {
            return Ok(routing_key.to_string());
        }
        self.bindings
            .get(&Self::binding_key(exchange, routing_key))
            .map(|q| q.value().clone())
            .ok_or_else(|| {
                FaultLineError::Transport(format!(
                    "no binding for {}/{}",
                    exchange, routing_key
                ))
            })
    }

    fn enqueue(inner: &Arc<BrokerInner>, queue: &str, msg: QueuedMessage) {
        let mut state = inner.queues.entry(queue.to_string()).or_default();
        state.depth += 1;

        // Consumer-less queue with a TTL'd route is a delay buffer: the
        // message republishes to the route when the TTL fires.
        if state.consumer.is_none() {
            if let Some(route) = state.dead_letter.clone() {
                if let Some(ttl) = route.ttl {
                    let inner_for_task = inner.clone();
                    let queue_name = queue.to_string();
                    drop(state);
                    inner.tasks.after(ttl, move || async move {
                        inner_for_task.complete(&queue_name);
                        BrokerInner::route_to(
                            &inner_for_task,
                            &route.exchange,
                            &route.routing_key,
                            msg,
                        );
                        Ok(())
                    });
                    return;
                }
            }
        }

        if let Some(tx) = state.consumer.clone() {
            match tx.send(msg) {
                Ok(()) => {}
                Err(mpsc::error::SendError(msg)) => {
                    // Consumer loop is gone; keep the message.
                    state.consumer = None;
                    state.pending.push_back(msg);
                }
            }
            return;
        }
        state.pending.push_back(msg);
    }

    fn complete(&self, queue: &str) {
        if let Some(mut state) = self.queues.get_mut(queue) {
            state.depth = state.depth.saturating_sub(1);
        }
    }

    fn route_to(inner: &Arc<BrokerInner>, exchange: &str, routing_key: &str, msg: QueuedMessage) {
        match inner.resolve(exchange, routing_key) {
            Ok(target) => BrokerInner::enqueue(inner, &target, msg),
            Err(e) => warn!(error = %e, "Dropping unroutable message"),
        }
    }

    fn dead_letter(inner: &Arc<BrokerInner>, queue: &str, msg: QueuedMessage) {
        let route = inner.queues.get(queue).and_then(|s| s.dead_letter.clone());
        match route {
            Some(route) => BrokerInner::route_to(inner, &route.exchange, &route.routing_key, msg),
            None => debug!(queue = %queue, message_id = %msg.message_id, "Rejected message discarded (no dead-letter route)"),
        }
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<()> {
        if self.is_down() {
            return Err(FaultLineError::TransportUnavailable(
                "broker marked down".to_string(),
            ));
        }
        let target = self.inner.resolve(exchange, routing_key)?;
        let msg = QueuedMessage {
            message_id: new_id(),
            payload,
            headers: options.headers,
            redelivered: false,
        };
        debug!(queue = %target, message_id = %msg.message_id, "Publishing message");
        BrokerInner::enqueue(&self.inner, &target, msg);
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, dead_letter: Option<DeadLetterRoute>) -> Result<()> {
        let mut state = self.inner.queues.entry(queue.to_string()).or_default();
        state.dead_letter = dead_letter;
        Ok(())
    }

    async fn bind(&self, exchange: &str, routing_key: &str, queue: &str) -> Result<()> {
        self.inner.queues.entry(queue.to_string()).or_default();
        self.inner.bindings.insert(
            BrokerInner::binding_key(exchange, routing_key),
            queue.to_string(),
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumeHandler>,
    ) -> Result<ConsumerHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.queues.entry(queue.to_string()).or_default();
            if state.consumer.is_some() {
                return Err(FaultLineError::Transport(format!(
                    "consumer already registered for queue {}",
                    queue
                )));
            }
            while let Some(msg) = state.pending.pop_front() {
                let _ = tx.send(msg);
            }
            state.consumer = Some(tx.clone());
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let inner = self.inner.clone();
        let queue_name = queue.to_string();
        let requeue_tx = tx;

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => {
                        // Detach and return undelivered messages to the queue.
                        if let Some(mut state) = inner.queues.get_mut(&queue_name) {
                            state.consumer = None;
                            while let Ok(msg) = rx.try_recv() {
                                state.pending.push_back(msg);
                            }
                        }
                        break;
                    }
                    maybe = rx.recv() => {
                        let Some(msg) = maybe else { break };
                        let delivery = Delivery {
                            message_id: msg.message_id.clone(),
                            payload: msg.payload.clone(),
                            headers: msg.headers.clone(),
                            redelivered: msg.redelivered,
                        };
                        match handler.handle(delivery).await {
                            Disposition::Ack => inner.complete(&queue_name),
                            Disposition::Nack { requeue: true } => {
                                let mut msg = msg;
                                msg.redelivered = true;
                                let _ = requeue_tx.send(msg);
                            }
                            Disposition::Nack { requeue: false } => {
                                inner.complete(&queue_name);
                                BrokerInner::dead_letter(&inner, &queue_name, msg);
                            }
                        }
                    }
                }
            }
        });
        self.inner.tasks.register(join);

        Ok(ConsumerHandle::new(cancel_tx))
    }

    fn queue_depth(&self, queue: &str) -> usize {
        self.inner.queues.get(queue).map(|s| s.depth).unwrap_or(0)
    }
}

impl TransportControl for InMemoryBroker {
    fn set_down(&self, down: bool) {
        self.inner.down.store(down, Ordering::SeqCst);
    }

    fn is_down(&self) -> bool {
        self.inner.down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<Delivery>>,
        disposition: Mutex<Box<dyn Fn(&Delivery) -> Disposition + Send>>,
    }

    impl Recorder {
        fn acking() -> Arc<Self> {
            Self::with(|_| Disposition::Ack)
        }

        fn with<F: Fn(&Delivery) -> Disposition + Send + 'static>(f: F) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                disposition: Mutex::new(Box::new(f)),
            })
        }

        fn ids(&self) -> Vec<String> {
            self.seen.lock().iter().map(|d| d.message_id.clone()).collect()
        }
    }

    #[async_trait]
    impl ConsumeHandler for Recorder {
        async fn handle(&self, delivery: Delivery) -> Disposition {
            let disposition = (self.disposition.lock())(&delivery);
            self.seen.lock().push(delivery);
            disposition
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn publish_consume_fifo_ack() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("work", None).await.unwrap();

        for i in 0..3 {
            broker
                .publish("", "work", serde_json::json!({ "n": i }), PublishOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(broker.queue_depth("work"), 3);

        let handler = Recorder::acking();
        let _consumer = broker.consume("work", handler.clone()).await.unwrap();
        settle().await;

        let seen = handler.seen.lock();
        let order: Vec<i64> = seen.iter().map(|d| d.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        drop(seen);
        assert_eq!(broker.queue_depth("work"), 0);
    }

    #[tokio::test]
    async fn nack_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("work", None).await.unwrap();

        let handler = Recorder::with(|d| {
            if d.redelivered {
                Disposition::Ack
            } else {
                Disposition::Nack { requeue: true }
            }
        });
        let _consumer = broker.consume("work", handler.clone()).await.unwrap();

        broker
            .publish("", "work", serde_json::json!({}), PublishOptions::default())
            .await
            .unwrap();
        settle().await;

        let seen = handler.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].redelivered);
        assert!(seen[1].redelivered);
    }

    #[tokio::test]
    async fn reject_routes_to_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("parking", None).await.unwrap();
        broker
            .declare_queue(
                "work",
                Some(DeadLetterRoute {
                    exchange: String::new(),
                    routing_key: "parking".to_string(),
                    ttl: None,
                }),
            )
            .await
            .unwrap();

        let handler = Recorder::with(|_| Disposition::Nack { requeue: false });
        let _consumer = broker.consume("work", handler).await.unwrap();

        broker
            .publish("", "work", serde_json::json!({}), PublishOptions::default())
            .await
            .unwrap();
        settle().await;

        assert_eq!(broker.queue_depth("work"), 0);
        assert_eq!(broker.queue_depth("parking"), 1);
    }

    #[tokio::test]
    async fn ttl_queue_delays_then_republishes() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("work", None).await.unwrap();
        broker
            .declare_queue(
                "retry",
                Some(DeadLetterRoute {
                    exchange: String::new(),
                    routing_key: "work".to_string(),
                    ttl: Some(Duration::from_millis(50)),
                }),
            )
            .await
            .unwrap();

        broker
            .publish("", "retry", serde_json::json!({}), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("retry"), 1);
        assert_eq!(broker.queue_depth("work"), 0);

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(broker.queue_depth("retry"), 0);
        assert_eq!(broker.queue_depth("work"), 1);
    }

    #[tokio::test]
    async fn publish_fails_while_down() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("work", None).await.unwrap();
        broker.set_down(true);

        let err = broker
            .publish("", "work", serde_json::json!({}), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FaultLineError::TransportUnavailable(_)));
        assert_eq!(broker.queue_depth("work"), 0);

        broker.set_down(false);
        broker
            .publish("", "work", serde_json::json!({}), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("work"), 1);
    }

    #[tokio::test]
    async fn cancel_returns_messages_to_queue() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("work", None).await.unwrap();

        // Slow handler so the second message is still undelivered at cancel.
        struct Slow;
        #[async_trait]
        impl ConsumeHandler for Slow {
            async fn handle(&self, _delivery: Delivery) -> Disposition {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Disposition::Ack
            }
        }

        let mut consumer = broker.consume("work", Arc::new(Slow)).await.unwrap();
        for _ in 0..2 {
            broker
                .publish("", "work", serde_json::json!({}), PublishOptions::default())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        consumer.cancel();
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Both remain owned by the queue; a fresh consumer sees the one that
        // was never delivered.
        let handler = Recorder::acking();
        let _consumer = broker.consume("work", handler.clone()).await.unwrap();
        settle().await;
        assert_eq!(handler.ids().len(), 1);
    }

    #[tokio::test]
    async fn exchange_binding_routes_publish() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("events", None).await.unwrap();
        broker.bind("orders", "created", "events").await.unwrap();

        broker
            .publish("orders", "created", serde_json::json!({}), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("events"), 1);

        let err = broker
            .publish("orders", "missing", serde_json::json!({}), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FaultLineError::Transport(_)));
    }
}
