//! Pipeline engine: consume, evaluate, escalate, park.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use fl_common::{new_id, BoundedLog, Result};
use fl_transport::{
    ConsumeHandler, ConsumerHandle, DeadLetterRoute, Delivery, Disposition, PublishOptions,
    Transport,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::message::{
    DlqMessage, FailureMode, MessageStatus, PipelineConfig, PipelineStats, RetryEvent,
};

pub const WORK_QUEUE: &str = "dlq.work";
pub const PARKING_QUEUE: &str = "dlq.parking";
const MESSAGE_ID_HEADER: &str = "messageId";
const RECORD_CAPACITY: usize = 50;

pub fn retry_queue(k: u32) -> String {
    format!("dlq.retry.{}", k)
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

struct PipelineShared {
    transport: Arc<dyn Transport>,
    records: Mutex<BoundedLog<DlqMessage>>,
    /// Total delivery attempts per live message id; cleared on completion
    /// and on manual replay.
    attempts: DashMap<String, u32>,
    config: Mutex<PipelineConfig>,
    counters: Counters,
    running: AtomicBool,
}

impl PipelineShared {
    fn with_record<R>(&self, id: &str, f: impl FnOnce(&mut DlqMessage) -> R) -> Option<R> {
        let mut records = self.records.lock();
        let result = records.iter_mut().find(|r| r.id == id).map(f);
        result
    }
}

pub struct RetryPipeline {
    shared: Arc<PipelineShared>,
    consumer: tokio::sync::Mutex<Option<ConsumerHandle>>,
}

impl RetryPipeline {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                transport,
                records: Mutex::new(BoundedLog::new(RECORD_CAPACITY)),
                attempts: DashMap::new(),
                config: Mutex::new(PipelineConfig::default()),
                counters: Counters::default(),
                running: AtomicBool::new(false),
            }),
            consumer: tokio::sync::Mutex::new(None),
        }
    }

    /// Declare the queue topology and attach the work consumer.
    pub async fn start_consuming(&self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Err(fl_common::FaultLineError::AlreadyRunning);
        }

        let transport = &self.shared.transport;
        transport.declare_queue(PARKING_QUEUE, None).await?;
        transport
            .declare_queue(
                WORK_QUEUE,
                Some(DeadLetterRoute {
                    exchange: String::new(),
                    routing_key: PARKING_QUEUE.to_string(),
                    ttl: None,
                }),
            )
            .await?;
        for k in 1..=config.max_retries {
            transport
                .declare_queue(
                    &retry_queue(k),
                    Some(DeadLetterRoute {
                        exchange: String::new(),
                        routing_key: WORK_QUEUE.to_string(),
                        ttl: Some(Duration::from_millis(config.retry_delay_ms(k))),
                    }),
                )
                .await?;
        }

        *self.shared.config.lock() = config.clone();
        let handler = Arc::new(WorkHandler {
            shared: self.shared.clone(),
        });
        *consumer = Some(transport.consume(WORK_QUEUE, handler).await?);
        self.shared.running.store(true, Ordering::SeqCst);
        info!(max_retries = config.max_retries, "DLQ pipeline consuming");
        Ok(())
    }

    /// Detach the consumer. Idempotent; queued messages stay in the
    /// transport.
    pub async fn stop_consuming(&self) {
        let mut consumer = self.consumer.lock().await;
        if let Some(mut handle) = consumer.take() {
            handle.cancel();
            info!("DLQ pipeline stopped");
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Create a work item and submit it to the work queue.
    pub async fn send_message(&self, payload: Value) -> Result<DlqMessage> {
        let max_retries = self.shared.config.lock().max_retries;
        let record = DlqMessage {
            id: new_id(),
            payload: payload.clone(),
            status: MessageStatus::Queued,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            last_attempt_at: None,
            dead_at: None,
            error: None,
            retry_history: Vec::new(),
        };
        self.shared.records.lock().push(record.clone());

        self.shared
            .transport
            .publish(
                "",
                WORK_QUEUE,
                payload,
                PublishOptions::default().with_header(MESSAGE_ID_HEADER, &record.id),
            )
            .await?;
        Ok(record)
    }

    pub async fn send_batch(&self, count: usize, payload: Value) -> Result<Vec<DlqMessage>> {
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(self.send_message(payload.clone()).await?);
        }
        Ok(records)
    }

    /// Replay a dead item: retry count resets, a manual entry lands in its
    /// history, and it re-enters the work queue with a fresh attempt
    /// counter. Returns `Ok(false)` when no dead item has that id.
    pub async fn retry_dead_message(&self, id: &str) -> Result<bool> {
        let payload = {
            let records = self.shared.records.lock();
            let payload = records
                .iter()
                .find(|r| r.id == id && r.status == MessageStatus::Dead)
                .map(|r| r.payload.clone());
            payload
        };
        let Some(payload) = payload else {
            return Ok(false);
        };

        self.shared
            .transport
            .publish(
                "",
                WORK_QUEUE,
                payload,
                PublishOptions::default().with_header(MESSAGE_ID_HEADER, id),
            )
            .await?;

        self.shared.attempts.remove(id);
        self.shared.with_record(id, |r| {
            r.retry_count = 0;
            r.dead_at = None;
            r.error = None;
            r.status = MessageStatus::Queued;
            r.retry_history.push(RetryEvent {
                attempt: 0,
                timestamp: Utc::now(),
                delay_ms: 0,
                error: "manual retry".to_string(),
                manual: true,
            });
        });
        info!(message_id = %id, "Dead message replayed");
        Ok(true)
    }

    pub async fn retry_all_dead(&self) -> Result<usize> {
        let dead_ids: Vec<String> = {
            let records = self.shared.records.lock();
            records
                .iter()
                .filter(|r| r.status == MessageStatus::Dead)
                .map(|r| r.id.clone())
                .collect()
        };
        let mut replayed = 0;
        for id in dead_ids {
            if self.retry_dead_message(&id).await? {
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    /// Drop a dead item from the store. Returns false when absent.
    pub fn discard_dead_message(&self, id: &str) -> bool {
        let mut records = self.shared.records.lock();
        let exists = records
            .iter()
            .any(|r| r.id == id && r.status == MessageStatus::Dead);
        if exists {
            records.retain(|r| r.id != id);
            info!(message_id = %id, "Dead message discarded");
        }
        exists
    }

    pub fn discard_all_dead(&self) -> usize {
        let mut records = self.shared.records.lock();
        let before = records.len();
        records.retain(|r| r.status != MessageStatus::Dead);
        before - records.len()
    }

    /// Most recent work items, oldest first.
    pub fn messages(&self) -> Vec<DlqMessage> {
        self.shared.records.lock().snapshot()
    }

    pub fn stats(&self) -> PipelineStats {
        let max_retries = self.shared.config.lock().max_retries;
        let transport = &self.shared.transport;
        PipelineStats {
            running: self.shared.running.load(Ordering::SeqCst),
            work_queue_depth: transport.queue_depth(WORK_QUEUE),
            retry_queue_depths: (1..=max_retries)
                .map(|k| transport.queue_depth(&retry_queue(k)))
                .collect(),
            parked_depth: transport.queue_depth(PARKING_QUEUE),
            processed: self.shared.counters.processed.load(Ordering::SeqCst),
            failed: self.shared.counters.failed.load(Ordering::SeqCst),
            retried: self.shared.counters.retried.load(Ordering::SeqCst),
            dead_lettered: self.shared.counters.dead_lettered.load(Ordering::SeqCst),
        }
    }
}

struct WorkHandler {
    shared: Arc<PipelineShared>,
}

#[async_trait]
impl ConsumeHandler for WorkHandler {
    async fn handle(&self, delivery: Delivery) -> Disposition {
        let Some(id) = delivery.headers.get(MESSAGE_ID_HEADER).cloned() else {
            warn!("Delivery without messageId header, discarding");
            return Disposition::Ack;
        };

        let attempt = {
            let mut entry = self.shared.attempts.entry(id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let config = self.shared.config.lock().clone();

        self.shared.with_record(&id, |r| {
            r.status = MessageStatus::Processing;
            r.last_attempt_at = Some(Utc::now());
        });

        tokio::time::sleep(Duration::from_millis(config.processing_delay_ms)).await;

        if !should_fail(config.failure_mode, attempt) {
            self.shared.attempts.remove(&id);
            self.shared.counters.processed.fetch_add(1, Ordering::SeqCst);
            self.shared.with_record(&id, |r| {
                r.status = MessageStatus::Completed;
                r.error = None;
            });
            debug!(message_id = %id, attempt, "Message processed");
            return Disposition::Ack;
        }

        self.shared.counters.failed.fetch_add(1, Ordering::SeqCst);
        let reason = format!("simulated failure on attempt {}", attempt);
        let retry_count = self
            .shared
            .with_record(&id, |r| r.retry_count)
            .unwrap_or(0);

        if retry_count < config.max_retries {
            let next = retry_count + 1;
            let delay_ms = config.retry_delay_ms(next);

            // Republish into the delay buffer before touching the record, so
            // a transport error leaves the delivery requeued instead of lost.
            let publish = self
                .shared
                .transport
                .publish(
                    "",
                    &retry_queue(next),
                    delivery.payload.clone(),
                    PublishOptions::default().with_header(MESSAGE_ID_HEADER, &id),
                )
                .await;
            if let Err(e) = publish {
                error!(message_id = %id, error = %e, "Failed to route to retry buffer");
                return Disposition::Nack { requeue: true };
            }

            self.shared.counters.retried.fetch_add(1, Ordering::SeqCst);
            self.shared.with_record(&id, |r| {
                r.retry_history.push(RetryEvent {
                    attempt,
                    timestamp: Utc::now(),
                    delay_ms,
                    error: reason.clone(),
                    manual: false,
                });
                r.retry_count = next;
                r.status = MessageStatus::Retry(next);
                r.error = Some(reason.clone());
            });
            debug!(message_id = %id, attempt, buffer = next, delay_ms, "Message routed to retry buffer");
            Disposition::Ack
        } else {
            self.shared
                .counters
                .dead_lettered
                .fetch_add(1, Ordering::SeqCst);
            self.shared.with_record(&id, |r| {
                r.retry_history.push(RetryEvent {
                    attempt,
                    timestamp: Utc::now(),
                    delay_ms: 0,
                    error: reason.clone(),
                    manual: false,
                });
                r.status = MessageStatus::Dead;
                r.dead_at = Some(Utc::now());
                r.error = Some(reason.clone());
            });
            warn!(message_id = %id, attempt, "Message dead-lettered");
            Disposition::Nack { requeue: false }
        }
    }
}

fn should_fail(mode: FailureMode, attempt: u32) -> bool {
    match mode {
        FailureMode::Always => true,
        FailureMode::Never => false,
        FailureMode::Random { probability } => rand::random::<f64>() < probability,
        FailureMode::FirstN { count } => attempt <= count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fl_transport::InMemoryBroker;

    fn pipeline() -> (RetryPipeline, InMemoryBroker) {
        let broker = InMemoryBroker::new();
        let pipeline = RetryPipeline::new(Arc::new(broker.clone()));
        (pipeline, broker)
    }

    fn fast_config(failure_mode: FailureMode, max_retries: u32) -> PipelineConfig {
        PipelineConfig {
            failure_mode,
            max_retries,
            processing_delay_ms: 0,
            retry_base_delay_ms: 20,
        }
    }

    async fn wait_until(timeout_ms: u64, cond: impl Fn() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn completes_on_first_successful_attempt() {
        let (pipeline, _broker) = pipeline();
        pipeline
            .start_consuming(fast_config(FailureMode::Never, 3))
            .await
            .unwrap();

        let record = pipeline
            .send_message(serde_json::json!({ "job": "resize" }))
            .await
            .unwrap();

        assert!(wait_until(500, || pipeline.stats().processed == 1).await);
        let messages = pipeline.messages();
        let msg = messages.iter().find(|m| m.id == record.id).unwrap();
        assert_eq!(msg.status, MessageStatus::Completed);
        assert!(msg.retry_history.is_empty());
        assert_eq!(pipeline.stats().work_queue_depth, 0);
    }

    #[tokio::test]
    async fn dead_letters_after_max_retries_plus_one_attempts() {
        let (pipeline, _broker) = pipeline();
        pipeline
            .start_consuming(fast_config(FailureMode::Always, 2))
            .await
            .unwrap();

        let record = pipeline.send_message(serde_json::json!({})).await.unwrap();
        assert!(wait_until(2_000, || pipeline.stats().dead_lettered == 1).await);

        let messages = pipeline.messages();
        let msg = messages.iter().find(|m| m.id == record.id).unwrap();
        assert_eq!(msg.status, MessageStatus::Dead);
        assert_eq!(msg.retry_count, 2);
        assert!(msg.dead_at.is_some());
        // One history entry per attempt: two retries plus the final verdict.
        assert_eq!(msg.retry_history.len(), 3);
        assert_eq!(msg.retry_history[0].delay_ms, 20);
        assert_eq!(msg.retry_history[1].delay_ms, 80);

        let stats = pipeline.stats();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.parked_depth, 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let (pipeline, _broker) = pipeline();
        pipeline
            .start_consuming(fast_config(FailureMode::FirstN { count: 1 }, 3))
            .await
            .unwrap();

        let record = pipeline.send_message(serde_json::json!({})).await.unwrap();
        assert!(wait_until(1_000, || pipeline.stats().processed == 1).await);

        let messages = pipeline.messages();
        let msg = messages.iter().find(|m| m.id == record.id).unwrap();
        assert_eq!(msg.status, MessageStatus::Completed);
        assert_eq!(msg.retry_count, 1);
        assert_eq!(msg.retry_history.len(), 1);
    }

    #[tokio::test]
    async fn replayed_dead_message_can_die_again() {
        let (pipeline, _broker) = pipeline();
        pipeline
            .start_consuming(fast_config(FailureMode::Always, 1))
            .await
            .unwrap();

        let record = pipeline.send_message(serde_json::json!({})).await.unwrap();
        assert!(wait_until(1_000, || pipeline.stats().dead_lettered == 1).await);

        assert!(pipeline.retry_dead_message(&record.id).await.unwrap());
        assert!(wait_until(1_000, || pipeline.stats().dead_lettered == 2).await);

        let messages = pipeline.messages();
        let msg = messages.iter().find(|m| m.id == record.id).unwrap();
        assert_eq!(msg.status, MessageStatus::Dead);
        assert_eq!(msg.retry_count, 1);
        assert!(msg.retry_history.iter().any(|e| e.manual));

        assert!(!pipeline.retry_dead_message("no-such-id").await.unwrap());
    }

    #[tokio::test]
    async fn discard_removes_dead_records() {
        let (pipeline, _broker) = pipeline();
        pipeline
            .start_consuming(fast_config(FailureMode::Always, 1))
            .await
            .unwrap();

        let record = pipeline.send_message(serde_json::json!({})).await.unwrap();
        assert!(wait_until(1_000, || pipeline.stats().dead_lettered == 1).await);

        assert!(pipeline.discard_dead_message(&record.id));
        assert!(pipeline.messages().iter().all(|m| m.id != record.id));
        assert!(!pipeline.discard_dead_message(&record.id));
    }

    #[tokio::test]
    async fn retry_all_dead_replays_every_parked_message() {
        let (pipeline, _broker) = pipeline();
        pipeline
            .start_consuming(fast_config(FailureMode::Always, 1))
            .await
            .unwrap();

        pipeline
            .send_batch(2, serde_json::json!({ "job": "sync" }))
            .await
            .unwrap();
        assert!(wait_until(1_500, || pipeline.stats().dead_lettered == 2).await);

        assert_eq!(pipeline.retry_all_dead().await.unwrap(), 2);
        assert!(wait_until(1_500, || pipeline.stats().dead_lettered == 4).await);
        assert_eq!(pipeline.discard_all_dead(), 2);
        assert!(pipeline.messages().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_config_and_double_start() {
        let (pipeline, _broker) = pipeline();

        let err = pipeline
            .start_consuming(fast_config(FailureMode::Never, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, fl_common::FaultLineError::Config(_)));

        pipeline
            .start_consuming(fast_config(FailureMode::Never, 3))
            .await
            .unwrap();
        let err = pipeline
            .start_consuming(fast_config(FailureMode::Never, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, fl_common::FaultLineError::AlreadyRunning));
    }

    #[tokio::test]
    async fn stopped_pipeline_leaves_messages_queued() {
        let (pipeline, _broker) = pipeline();
        pipeline
            .start_consuming(fast_config(FailureMode::Never, 3))
            .await
            .unwrap();
        pipeline.stop_consuming().await;
        pipeline.stop_consuming().await; // idempotent

        let record = pipeline.send_message(serde_json::json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = pipeline.stats();
        assert!(!stats.running);
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.work_queue_depth, 1);
        let messages = pipeline.messages();
        let msg = messages.iter().find(|m| m.id == record.id).unwrap();
        assert_eq!(msg.status, MessageStatus::Queued);
    }
}
