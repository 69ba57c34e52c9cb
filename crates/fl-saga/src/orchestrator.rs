//! Forward steps, reverse compensations, bounded run log.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fl_common::{new_id, BoundedLog};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

const SAGA_LOG_CAPACITY: usize = 50;

/// The order saga's forward steps and their compensating actions. The
/// notify step is fire-and-forget; undoing it is a no-op.
const STEP_DEFINITIONS: [(&str, Option<&str>); 4] = [
    ("reserve-inventory", Some("release-inventory")),
    ("charge-payment", Some("refund-payment")),
    ("create-shipment", Some("cancel-shipment")),
    ("notify-customer", None),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Done,
    Failed,
    Compensated,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStep {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation: Option<String>,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaOutcome {
    Succeeded,
    Compensated,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaResult {
    pub saga_id: String,
    pub payload: Value,
    pub steps: Vec<SagaStep>,
    pub outcome: SagaOutcome,
    /// Compensating actions that ran, in execution (reverse-completion)
    /// order.
    pub compensations_run: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaOptions {
    /// Force the step at this index to fail, for testing the unwind path.
    pub fail_at_step: Option<usize>,
    pub step_delay_ms: u64,
    pub compensation_delay_ms: u64,
}

impl Default for SagaOptions {
    fn default() -> Self {
        Self {
            fail_at_step: None,
            step_delay_ms: 100,
            compensation_delay_ms: 50,
        }
    }
}

pub struct SagaOrchestrator {
    logs: Mutex<BoundedLog<SagaResult>>,
}

impl SagaOrchestrator {
    pub fn new() -> Self {
        Self {
            logs: Mutex::new(BoundedLog::new(SAGA_LOG_CAPACITY)),
        }
    }

    /// Run one order saga to completion and persist the result.
    pub async fn run_order_saga(&self, payload: Value, options: SagaOptions) -> SagaResult {
        let saga_id = new_id();
        let started_at = Utc::now();
        let mut steps: Vec<SagaStep> = STEP_DEFINITIONS
            .iter()
            .map(|(name, compensation)| SagaStep {
                name: name.to_string(),
                compensation: compensation.map(|c| c.to_string()),
                status: StepStatus::Pending,
                started_at: None,
                finished_at: None,
                error: None,
            })
            .collect();

        let mut failed_at: Option<usize> = None;
        for (idx, step) in steps.iter_mut().enumerate() {
            step.started_at = Some(Utc::now());
            tokio::time::sleep(Duration::from_millis(options.step_delay_ms)).await;

            if options.fail_at_step == Some(idx) {
                step.status = StepStatus::Failed;
                step.error = Some(format!("forced failure at step {}", idx));
                warn!(saga_id = %saga_id, step = %step.name, "Saga step failed, unwinding");
                failed_at = Some(idx);
                break;
            }
            step.status = StepStatus::Done;
            step.finished_at = Some(Utc::now());
        }

        let mut compensations_run = Vec::new();
        let outcome = match failed_at {
            None => SagaOutcome::Succeeded,
            Some(_) => {
                // Unwind completed steps only, newest first. Compensations
                // are best-effort and always complete.
                let done: Vec<usize> = steps
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.status == StepStatus::Done)
                    .map(|(i, _)| i)
                    .collect();
                for idx in done.into_iter().rev() {
                    tokio::time::sleep(Duration::from_millis(options.compensation_delay_ms))
                        .await;
                    let step = &mut steps[idx];
                    step.status = StepStatus::Compensated;
                    let action = step
                        .compensation
                        .clone()
                        .unwrap_or_else(|| format!("undo-{}", step.name));
                    info!(saga_id = %saga_id, action = %action, "Compensation applied");
                    compensations_run.push(action);
                }
                SagaOutcome::Compensated
            }
        };

        let result = SagaResult {
            saga_id: saga_id.clone(),
            payload,
            steps,
            outcome,
            compensations_run,
            started_at,
            finished_at: Utc::now(),
        };
        self.logs.lock().push(result.clone());
        info!(saga_id = %saga_id, outcome = ?outcome, "Saga finished");
        result
    }

    /// Most recent runs, oldest first.
    pub fn saga_logs(&self) -> Vec<SagaResult> {
        self.logs.lock().snapshot()
    }

    pub fn saga_by_id(&self, saga_id: &str) -> Option<SagaResult> {
        self.logs
            .lock()
            .iter()
            .find(|r| r.saga_id == saga_id)
            .cloned()
    }

    pub fn clear_logs(&self) {
        self.logs.lock().clear();
    }
}

impl Default for SagaOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}
