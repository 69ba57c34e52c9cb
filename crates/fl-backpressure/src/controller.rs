//! Producer/consumer loops, bounded buffer, overflow policies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fl_common::{new_id, BoundedLog, FaultLineError, Result, TaskRegistry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

const MESSAGE_LOG_CAPACITY: usize = 200;
const WAIT_SAMPLE_CAPACITY: usize = 200;
const THROUGHPUT_WINDOW_MS: i64 = 3_000;
const BLOCK_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowMessageStatus {
    Queued,
    Done,
    Dropped,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMessage {
    pub id: String,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub dropped_at: Option<DateTime<Utc>>,
    pub status: FlowMessageStatus,
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    Oldest,
    Newest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowStrategy {
    Block,
    Reject,
    Drop { policy: DropPolicy },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    pub producer_rate_per_sec: u32,
    pub consumer_rate_per_sec: u32,
    pub max_queue_depth: usize,
    pub strategy: OverflowStrategy,
    /// Max items the consumer pulls per tick.
    pub prefetch_count: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            producer_rate_per_sec: 8,
            consumer_rate_per_sec: 4,
            max_queue_depth: 10,
            strategy: OverflowStrategy::Drop {
                policy: DropPolicy::Oldest,
            },
            prefetch_count: 1,
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.producer_rate_per_sec == 0 || self.consumer_rate_per_sec == 0 {
            return Err(FaultLineError::Config(
                "producer and consumer rates must be at least 1/sec".to_string(),
            ));
        }
        if self.max_queue_depth == 0 {
            return Err(FaultLineError::Config(
                "max_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.prefetch_count == 0 {
            return Err(FaultLineError::Config(
                "prefetch_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfigUpdate {
    pub producer_rate_per_sec: Option<u32>,
    pub consumer_rate_per_sec: Option<u32>,
    pub max_queue_depth: Option<usize>,
    pub strategy: Option<OverflowStrategy>,
    pub prefetch_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub running: bool,
    pub queue_depth: usize,
    pub max_queue_depth: usize,
    pub produced: u64,
    pub consumed: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub blocked: u64,
    pub avg_wait_ms: f64,
    pub p95_wait_ms: u64,
    /// Rolling-window rates over the last 3 seconds, not lifetime averages.
    pub producer_throughput_per_sec: f64,
    pub consumer_throughput_per_sec: f64,
    pub config: FlowConfig,
}

#[derive(Debug, Default)]
struct FlowCounters {
    produced: u64,
    consumed: u64,
    dropped: u64,
    rejected: u64,
    blocked: u64,
}

struct FlowState {
    queue: VecDeque<FlowMessage>,
    log: BoundedLog<FlowMessage>,
    wait_samples: BoundedLog<u64>,
    produced_stamps: VecDeque<DateTime<Utc>>,
    consumed_stamps: VecDeque<DateTime<Utc>>,
    counters: FlowCounters,
    seq: u64,
}

impl FlowState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            log: BoundedLog::new(MESSAGE_LOG_CAPACITY),
            wait_samples: BoundedLog::new(WAIT_SAMPLE_CAPACITY),
            produced_stamps: VecDeque::new(),
            consumed_stamps: VecDeque::new(),
            counters: FlowCounters::default(),
            seq: 0,
        }
    }
}

struct FlowShared {
    config: Mutex<FlowConfig>,
    state: Mutex<FlowState>,
    running: AtomicBool,
}

pub struct BackpressureController {
    shared: Arc<FlowShared>,
    tasks: Mutex<Option<Arc<TaskRegistry>>>,
}

impl BackpressureController {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FlowShared {
                config: Mutex::new(FlowConfig::default()),
                state: Mutex::new(FlowState::new()),
                running: AtomicBool::new(false),
            }),
            tasks: Mutex::new(None),
        }
    }

    /// Start the producer and consumer loops.
    pub fn start(&self, config: FlowConfig) -> Result<()> {
        config.validate()?;
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return Err(FaultLineError::AlreadyRunning);
        }
        *self.shared.config.lock() = config;

        let registry = Arc::new(TaskRegistry::new());

        // Producer loop; the period follows the live config.
        {
            let shared = self.shared.clone();
            let registry_for_retry = registry.clone();
            let mut shutdown_rx = registry.subscribe();
            let handle = tokio::spawn(async move {
                loop {
                    let period_ms =
                        1_000 / shared.config.lock().producer_rate_per_sec.max(1) as u64;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(period_ms)) => {
                            produce_one(&shared, &registry_for_retry);
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
            registry.register(handle);
        }

        // Consumer loop.
        {
            let shared = self.shared.clone();
            let mut shutdown_rx = registry.subscribe();
            let handle = tokio::spawn(async move {
                loop {
                    let period_ms =
                        1_000 / shared.config.lock().consumer_rate_per_sec.max(1) as u64;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(period_ms)) => {
                            consume_tick(&shared);
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
            registry.register(handle);
        }

        *tasks = Some(registry);
        self.shared.running.store(true, Ordering::SeqCst);
        info!("Backpressure simulation started");
        Ok(())
    }

    /// Cancel both loops and any pending block-retries. Idempotent.
    pub fn stop(&self) {
        if let Some(registry) = self.tasks.lock().take() {
            registry.shutdown();
            info!("Backpressure simulation stopped");
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Reset queue, log, samples, and counters.
    pub fn clear(&self) {
        *self.shared.state.lock() = FlowState::new();
    }

    /// Apply a partial config update; loops pick it up on their next tick.
    pub fn update_config(&self, update: FlowConfigUpdate) -> Result<FlowConfig> {
        let mut config = self.shared.config.lock();
        let mut next = config.clone();
        if let Some(v) = update.producer_rate_per_sec {
            next.producer_rate_per_sec = v;
        }
        if let Some(v) = update.consumer_rate_per_sec {
            next.consumer_rate_per_sec = v;
        }
        if let Some(v) = update.max_queue_depth {
            next.max_queue_depth = v;
        }
        if let Some(v) = update.strategy {
            next.strategy = v;
        }
        if let Some(v) = update.prefetch_count {
            next.prefetch_count = v;
        }
        next.validate()?;
        *config = next.clone();
        Ok(next)
    }

    pub fn stats(&self) -> FlowStats {
        let config = self.shared.config.lock().clone();
        let mut state = self.shared.state.lock();
        let now = Utc::now();
        prune_stamps(&mut state.produced_stamps, now);
        prune_stamps(&mut state.consumed_stamps, now);

        let samples: Vec<u64> = state.wait_samples.snapshot();
        let avg_wait_ms = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        };
        let p95_wait_ms = percentile(&samples, 0.95);

        let window_secs = THROUGHPUT_WINDOW_MS as f64 / 1_000.0;
        FlowStats {
            running: self.shared.running.load(Ordering::SeqCst),
            queue_depth: state.queue.len(),
            max_queue_depth: config.max_queue_depth,
            produced: state.counters.produced,
            consumed: state.counters.consumed,
            dropped: state.counters.dropped,
            rejected: state.counters.rejected,
            blocked: state.counters.blocked,
            avg_wait_ms,
            p95_wait_ms,
            producer_throughput_per_sec: state.produced_stamps.len() as f64 / window_secs,
            consumer_throughput_per_sec: state.consumed_stamps.len() as f64 / window_secs,
            config,
        }
    }

    /// Finished messages (done, dropped, rejected), oldest first.
    pub fn message_log(&self) -> Vec<FlowMessage> {
        self.shared.state.lock().log.snapshot()
    }

    /// Messages currently waiting in the buffer, FIFO order.
    pub fn queue_snapshot(&self) -> Vec<FlowMessage> {
        self.shared.state.lock().queue.iter().cloned().collect()
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackpressureController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce_one(shared: &Arc<FlowShared>, registry: &Arc<TaskRegistry>) {
    let config = shared.config.lock().clone();
    let mut state = shared.state.lock();
    let now = Utc::now();

    state.counters.produced += 1;
    let seq = state.seq;
    state.seq += 1;
    state.produced_stamps.push_back(now);
    prune_stamps(&mut state.produced_stamps, now);

    let mut msg = FlowMessage {
        id: new_id(),
        payload: serde_json::json!({ "seq": seq }),
        produced_at: now,
        processed_at: None,
        dropped_at: None,
        status: FlowMessageStatus::Queued,
        wait_ms: None,
    };

    if state.queue.len() < config.max_queue_depth {
        state.queue.push_back(msg);
        return;
    }

    match config.strategy {
        OverflowStrategy::Drop {
            policy: DropPolicy::Oldest,
        } => {
            if let Some(mut evicted) = state.queue.pop_front() {
                evicted.status = FlowMessageStatus::Dropped;
                evicted.dropped_at = Some(now);
                state.counters.dropped += 1;
                state.log.push(evicted);
            }
            state.queue.push_back(msg);
        }
        OverflowStrategy::Drop {
            policy: DropPolicy::Newest,
        } => {
            msg.status = FlowMessageStatus::Dropped;
            msg.dropped_at = Some(now);
            state.counters.dropped += 1;
            state.log.push(msg);
        }
        OverflowStrategy::Reject => {
            // Synchronous refusal; the queue is untouched.
            msg.status = FlowMessageStatus::Rejected;
            state.counters.rejected += 1;
            state.log.push(msg);
        }
        OverflowStrategy::Block => {
            // The producer waits briefly, then retries once; if the buffer
            // is still full, the message is dropped rather than retried
            // forever.
            state.counters.blocked += 1;
            drop(state);
            debug!(seq, "Producer blocked, retrying once");
            let shared = shared.clone();
            registry.after(Duration::from_millis(BLOCK_RETRY_DELAY_MS), move || {
                async move {
                    let mut msg = msg;
                    let max_depth = shared.config.lock().max_queue_depth;
                    let mut state = shared.state.lock();
                    if state.queue.len() < max_depth {
                        state.queue.push_back(msg);
                    } else {
                        let now = Utc::now();
                        msg.status = FlowMessageStatus::Dropped;
                        msg.dropped_at = Some(now);
                        state.counters.dropped += 1;
                        state.log.push(msg);
                    }
                    Ok(())
                }
            });
        }
    }
}

fn consume_tick(shared: &Arc<FlowShared>) {
    let config = shared.config.lock().clone();
    let mut state = shared.state.lock();
    for _ in 0..config.prefetch_count {
        let Some(mut msg) = state.queue.pop_front() else {
            break;
        };
        let now = Utc::now();
        let wait = (now - msg.produced_at).num_milliseconds().max(0) as u64;
        msg.processed_at = Some(now);
        msg.status = FlowMessageStatus::Done;
        msg.wait_ms = Some(wait);
        state.wait_samples.push(wait);
        state.consumed_stamps.push_back(now);
        prune_stamps(&mut state.consumed_stamps, now);
        state.counters.consumed += 1;
        state.log.push(msg);
    }
}

fn prune_stamps(stamps: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    while let Some(oldest) = stamps.front() {
        if (now - *oldest).num_milliseconds() > THROUGHPUT_WINDOW_MS {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

fn percentile(samples: &[u64], q: f64) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller_with(config: FlowConfig) -> BackpressureController {
        let controller = BackpressureController::new();
        *controller.shared.config.lock() = config;
        controller
    }

    fn seq_of(msg: &FlowMessage) -> u64 {
        msg.payload["seq"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn drop_oldest_evicts_the_earliest_produced() {
        let controller = controller_with(FlowConfig {
            max_queue_depth: 5,
            strategy: OverflowStrategy::Drop {
                policy: DropPolicy::Oldest,
            },
            ..FlowConfig::default()
        });
        let registry = Arc::new(TaskRegistry::new());

        for _ in 0..8 {
            produce_one(&controller.shared, &registry);
        }

        let queue = controller.queue_snapshot();
        assert_eq!(queue.len(), 5);
        let seqs: Vec<u64> = queue.iter().map(seq_of).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6, 7]);

        let stats = controller.stats();
        assert_eq!(stats.produced, 8);
        assert_eq!(stats.dropped, 3);
        let dropped: Vec<u64> = controller
            .message_log()
            .iter()
            .filter(|m| m.status == FlowMessageStatus::Dropped)
            .map(seq_of)
            .collect();
        assert_eq!(dropped, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn drop_newest_keeps_the_queue_untouched() {
        let controller = controller_with(FlowConfig {
            max_queue_depth: 3,
            strategy: OverflowStrategy::Drop {
                policy: DropPolicy::Newest,
            },
            ..FlowConfig::default()
        });
        let registry = Arc::new(TaskRegistry::new());

        for _ in 0..5 {
            produce_one(&controller.shared, &registry);
        }

        let seqs: Vec<u64> = controller.queue_snapshot().iter().map(seq_of).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(controller.stats().dropped, 2);
    }

    #[tokio::test]
    async fn reject_refuses_without_touching_the_queue() {
        let controller = controller_with(FlowConfig {
            max_queue_depth: 2,
            strategy: OverflowStrategy::Reject,
            ..FlowConfig::default()
        });
        let registry = Arc::new(TaskRegistry::new());

        for _ in 0..4 {
            produce_one(&controller.shared, &registry);
        }

        let seqs: Vec<u64> = controller.queue_snapshot().iter().map(seq_of).collect();
        assert_eq!(seqs, vec![0, 1]);
        let stats = controller.stats();
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.dropped, 0);
        assert!(controller
            .message_log()
            .iter()
            .all(|m| m.status == FlowMessageStatus::Rejected));
    }

    #[tokio::test]
    async fn blocked_producer_retries_once_into_freed_room() {
        let controller = controller_with(FlowConfig {
            max_queue_depth: 1,
            strategy: OverflowStrategy::Block,
            prefetch_count: 1,
            ..FlowConfig::default()
        });
        let registry = Arc::new(TaskRegistry::new());

        produce_one(&controller.shared, &registry);
        produce_one(&controller.shared, &registry); // buffer full, blocks
        assert_eq!(controller.stats().blocked, 1);
        assert_eq!(controller.stats().queue_depth, 1);

        // Free the slot before the retry fires.
        consume_tick(&controller.shared);
        tokio::time::sleep(Duration::from_millis(BLOCK_RETRY_DELAY_MS + 100)).await;

        let stats = controller.stats();
        assert_eq!(stats.queue_depth, 1);
        assert_eq!(stats.dropped, 0);
        let seqs: Vec<u64> = controller.queue_snapshot().iter().map(seq_of).collect();
        assert_eq!(seqs, vec![1]);
    }

    #[tokio::test]
    async fn blocked_producer_drops_after_one_failed_retry() {
        let controller = controller_with(FlowConfig {
            max_queue_depth: 1,
            strategy: OverflowStrategy::Block,
            ..FlowConfig::default()
        });
        let registry = Arc::new(TaskRegistry::new());

        produce_one(&controller.shared, &registry);
        produce_one(&controller.shared, &registry);
        tokio::time::sleep(Duration::from_millis(BLOCK_RETRY_DELAY_MS + 100)).await;

        let stats = controller.stats();
        assert_eq!(stats.queue_depth, 1);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn consumer_records_wait_times() {
        let controller = controller_with(FlowConfig::default());
        let registry = Arc::new(TaskRegistry::new());

        produce_one(&controller.shared, &registry);
        tokio::time::sleep(Duration::from_millis(30)).await;
        consume_tick(&controller.shared);

        let log = controller.message_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, FlowMessageStatus::Done);
        let wait = log[0].wait_ms.unwrap();
        assert!(wait >= 20, "wait_ms was {}", wait);
        assert!(controller.stats().avg_wait_ms >= 20.0);
    }

    #[tokio::test]
    async fn prefetch_drains_up_to_count_per_tick() {
        let controller = controller_with(FlowConfig {
            max_queue_depth: 10,
            prefetch_count: 3,
            ..FlowConfig::default()
        });
        let registry = Arc::new(TaskRegistry::new());

        for _ in 0..5 {
            produce_one(&controller.shared, &registry);
        }
        consume_tick(&controller.shared);
        assert_eq!(controller.stats().queue_depth, 2);
        assert_eq!(controller.stats().consumed, 3);
    }

    #[tokio::test]
    async fn loops_run_and_respect_the_depth_bound() {
        let controller = BackpressureController::new();
        controller
            .start(FlowConfig {
                producer_rate_per_sec: 100,
                consumer_rate_per_sec: 20,
                max_queue_depth: 5,
                strategy: OverflowStrategy::Drop {
                    policy: DropPolicy::Oldest,
                },
                prefetch_count: 1,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = controller.stats();
        assert!(stats.running);
        assert!(stats.produced > 5);
        assert!(stats.queue_depth <= 5);
        assert!(stats.producer_throughput_per_sec > 0.0);

        controller.stop();
        controller.stop(); // idempotent
        let produced_after_stop = controller.stats().produced;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.stats().produced, produced_after_stop);
        assert!(!controller.stats().running);
    }

    #[tokio::test]
    async fn start_rejects_bad_config_and_double_start() {
        let controller = BackpressureController::new();
        let err = controller
            .start(FlowConfig {
                producer_rate_per_sec: 0,
                ..FlowConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, FaultLineError::Config(_)));

        controller.start(FlowConfig::default()).unwrap();
        let err = controller.start(FlowConfig::default()).unwrap_err();
        assert!(matches!(err, FaultLineError::AlreadyRunning));
        controller.stop();
    }

    #[tokio::test]
    async fn update_config_validates_and_applies() {
        let controller = BackpressureController::new();
        let err = controller
            .update_config(FlowConfigUpdate {
                prefetch_count: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, FaultLineError::Config(_)));

        let updated = controller
            .update_config(FlowConfigUpdate {
                consumer_rate_per_sec: Some(50),
                strategy: Some(OverflowStrategy::Reject),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.consumer_rate_per_sec, 50);
        assert_eq!(updated.strategy, OverflowStrategy::Reject);
    }

    #[tokio::test]
    async fn clear_resets_everything() {
        let controller = controller_with(FlowConfig::default());
        let registry = Arc::new(TaskRegistry::new());
        for _ in 0..4 {
            produce_one(&controller.shared, &registry);
        }
        consume_tick(&controller.shared);

        controller.clear();
        let stats = controller.stats();
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.produced, 0);
        assert_eq!(stats.consumed, 0);
        assert!(controller.message_log().is_empty());
    }
}
