//! Closed / open / half-open state machine with sliding-window failure
//! counting.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fl_common::{new_id, BoundedLog, FaultLineError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const CALL_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Success,
    Failure,
    Rejected,
    Fallback,
}

/// One entry in the bounded call log. This is the shape clients inspect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: CallOutcome,
    pub duration_ms: u64,
    pub state_at_call_start: CircuitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfig {
    /// Failures within `window_ms` that trip the circuit.
    pub failure_threshold: u32,
    /// Sliding window for failure counting.
    pub window_ms: u64,
    /// Time spent open before a recovery probe is allowed.
    pub timeout_ms: u64,
    /// Simulated cost of the protected call.
    pub service_latency_ms: u64,
    pub fallback_enabled: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_ms: 10_000,
            timeout_ms: 15_000,
            service_latency_ms: 200,
            fallback_enabled: false,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(FaultLineError::Config(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.window_ms == 0 || self.timeout_ms == 0 {
            return Err(FaultLineError::Config(
                "window_ms and timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial config update; unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfigUpdate {
    pub failure_threshold: Option<u32>,
    pub window_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub service_latency_ms: Option<u64>,
    pub fallback_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_at: Option<DateTime<Utc>>,
    pub service_down: bool,
    pub total_calls: u64,
    pub total_success: u64,
    pub total_failure: u64,
    pub total_rejected: u64,
    pub total_fallback: u64,
    pub config: BreakerConfig,
}

#[derive(Debug, Default)]
struct Counters {
    calls: u64,
    success: u64,
    failure: u64,
    rejected: u64,
    fallback: u64,
}

struct BreakerState {
    state: CircuitState,
    failure_times: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    service_down: bool,
    config: BreakerConfig,
    counters: Counters,
    call_log: BoundedLog<CallRecord>,
}

enum CallPlan {
    /// Circuit is open (or a trial is already in flight): short-circuit.
    ShortCircuit { fallback: bool },
    /// Execute the protected call; `trial` marks the half-open probe.
    Execute { trial: bool },
}

pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_times: VecDeque::new(),
                opened_at: None,
                half_open_at: None,
                trial_in_flight: false,
                service_down: false,
                config,
                counters: Counters::default(),
                call_log: BoundedLog::new(CALL_LOG_CAPACITY),
            }),
        })
    }

    /// Invoke the protected operation through the breaker.
    pub async fn call(&self, label: &str) -> CallRecord {
        let now = Utc::now();
        let started = std::time::Instant::now();

        let (plan, state_at_start, latency) = {
            let mut s = self.state.lock();
            s.counters.calls += 1;
            prune_window(&mut s, now);

            // An open circuit transitions to half-open once the cooldown
            // elapses, before this call is evaluated.
            if s.state == CircuitState::Open {
                let elapsed_ms = s
                    .opened_at
                    .map(|at| (now - at).num_milliseconds().max(0) as u64)
                    .unwrap_or(u64::MAX);
                if elapsed_ms >= s.config.timeout_ms {
                    s.state = CircuitState::HalfOpen;
                    s.half_open_at = Some(now);
                    s.trial_in_flight = false;
                    info!(elapsed_ms, "Circuit half-open, next call is a trial");
                }
            }

            let state_at_start = s.state;
            let plan = match s.state {
                CircuitState::Open => CallPlan::ShortCircuit {
                    fallback: s.config.fallback_enabled,
                },
                CircuitState::HalfOpen => {
                    if s.trial_in_flight {
                        // Only one trial may execute while half-open.
                        CallPlan::ShortCircuit {
                            fallback: s.config.fallback_enabled,
                        }
                    } else {
                        s.trial_in_flight = true;
                        CallPlan::Execute { trial: true }
                    }
                }
                CircuitState::Closed => CallPlan::Execute { trial: false },
            };
            (plan, state_at_start, s.config.service_latency_ms)
        };

        let record = match plan {
            CallPlan::ShortCircuit { fallback } => {
                let mut s = self.state.lock();
                let record = if fallback {
                    s.counters.fallback += 1;
                    CallRecord {
                        id: new_id(),
                        timestamp: now,
                        outcome: CallOutcome::Fallback,
                        duration_ms: 0,
                        state_at_call_start: state_at_start,
                        error: None,
                        response: Some(serde_json::json!({
                            "status": "fallback",
                            "label": label,
                            "source": "cache",
                        })),
                    }
                } else {
                    s.counters.rejected += 1;
                    CallRecord {
                        id: new_id(),
                        timestamp: now,
                        outcome: CallOutcome::Rejected,
                        duration_ms: 0,
                        state_at_call_start: state_at_start,
                        error: Some("circuit open, call rejected".to_string()),
                        response: None,
                    }
                };
                s.call_log.push(record.clone());
                record
            }
            CallPlan::Execute { trial } => {
                // The simulated downstream call; the lock is not held here.
                tokio::time::sleep(Duration::from_millis(latency)).await;

                let mut s = self.state.lock();
                let succeeded = !s.service_down;
                let finished = Utc::now();
                let duration_ms = started.elapsed().as_millis() as u64;

                let record = if succeeded {
                    s.counters.success += 1;
                    if trial {
                        s.state = CircuitState::Closed;
                        s.failure_times.clear();
                        s.opened_at = None;
                        s.half_open_at = None;
                        s.trial_in_flight = false;
                        info!("Trial call succeeded, circuit closed");
                    }
                    CallRecord {
                        id: new_id(),
                        timestamp: now,
                        outcome: CallOutcome::Success,
                        duration_ms,
                        state_at_call_start: state_at_start,
                        error: None,
                        response: Some(serde_json::json!({
                            "status": "ok",
                            "label": label,
                        })),
                    }
                } else {
                    s.counters.failure += 1;
                    if trial {
                        s.state = CircuitState::Open;
                        s.opened_at = Some(finished);
                        s.trial_in_flight = false;
                        warn!("Trial call failed, circuit reopened");
                    } else {
                        s.failure_times.push_back(finished);
                        prune_window(&mut s, finished);
                        if s.state == CircuitState::Closed
                            && s.failure_times.len() >= s.config.failure_threshold as usize
                        {
                            s.state = CircuitState::Open;
                            s.opened_at = Some(finished);
                            warn!(
                                failures = s.failure_times.len(),
                                window_ms = s.config.window_ms,
                                "Failure threshold reached, circuit opened"
                            );
                        }
                    }
                    CallRecord {
                        id: new_id(),
                        timestamp: now,
                        outcome: CallOutcome::Failure,
                        duration_ms,
                        state_at_call_start: state_at_start,
                        error: Some("simulated service failure".to_string()),
                        response: None,
                    }
                };
                s.call_log.push(record.clone());
                record
            }
        };

        debug!(
            outcome = ?record.outcome,
            state = ?record.state_at_call_start,
            "Breaker call finished"
        );
        record
    }

    pub async fn call_batch(&self, count: usize) -> Vec<CallRecord> {
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            records.push(self.call(&format!("batch-{}", i)).await);
        }
        records
    }

    /// Mark the simulated downstream service up or down.
    pub fn set_service_down(&self, down: bool) {
        self.state.lock().service_down = down;
    }

    /// Operator override: force the circuit closed and clear the window.
    pub fn reset_circuit(&self) {
        let mut s = self.state.lock();
        s.state = CircuitState::Closed;
        s.failure_times.clear();
        s.opened_at = None;
        s.half_open_at = None;
        s.trial_in_flight = false;
        info!("Circuit manually reset");
    }

    /// Operator override: force the circuit open with a full window.
    pub fn trip_circuit(&self) {
        let mut s = self.state.lock();
        let now = Utc::now();
        s.state = CircuitState::Open;
        s.opened_at = Some(now);
        s.half_open_at = None;
        s.trial_in_flight = false;
        s.failure_times.clear();
        for _ in 0..s.config.failure_threshold {
            s.failure_times.push_back(now);
        }
        warn!("Circuit manually tripped");
    }

    /// Apply a partial config update. Rejected updates leave the breaker
    /// untouched.
    pub fn update_config(&self, update: BreakerConfigUpdate) -> Result<BreakerConfig> {
        let mut s = self.state.lock();
        let mut next = s.config.clone();
        if let Some(v) = update.failure_threshold {
            next.failure_threshold = v;
        }
        if let Some(v) = update.window_ms {
            next.window_ms = v;
        }
        if let Some(v) = update.timeout_ms {
            next.timeout_ms = v;
        }
        if let Some(v) = update.service_latency_ms {
            next.service_latency_ms = v;
        }
        if let Some(v) = update.fallback_enabled {
            next.fallback_enabled = v;
        }
        next.validate()?;
        s.config = next.clone();
        Ok(next)
    }

    pub fn status(&self) -> BreakerStatus {
        let mut s = self.state.lock();
        let now = Utc::now();
        prune_window(&mut s, now);
        BreakerStatus {
            state: s.state,
            failures_in_window: s.failure_times.len(),
            opened_at: s.opened_at,
            half_open_at: s.half_open_at,
            service_down: s.service_down,
            total_calls: s.counters.calls,
            total_success: s.counters.success,
            total_failure: s.counters.failure,
            total_rejected: s.counters.rejected,
            total_fallback: s.counters.fallback,
            config: s.config.clone(),
        }
    }

    /// Most recent calls, oldest first.
    pub fn call_log(&self) -> Vec<CallRecord> {
        self.state.lock().call_log.snapshot()
    }
}

fn prune_window(s: &mut BreakerState, now: DateTime<Utc>) {
    let window = s.config.window_ms as i64;
    while let Some(oldest) = s.failure_times.front() {
        if (now - *oldest).num_milliseconds() > window {
            s.failure_times.pop_front();
        } else {
            break;
        }
    }
}
