//! Work-item records, pipeline config, and stats shapes.

use chrono::{DateTime, Utc};
use fl_common::{FaultLineError, Result};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Lifecycle of a work item. `Retry(k)` serializes as `retry_k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Queued,
    Processing,
    Completed,
    Retry(u32),
    Dead,
}

impl MessageStatus {
    pub fn label(&self) -> String {
        match self {
            MessageStatus::Queued => "queued".to_string(),
            MessageStatus::Processing => "processing".to_string(),
            MessageStatus::Completed => "completed".to_string(),
            MessageStatus::Retry(k) => format!("retry_{}", k),
            MessageStatus::Dead => "dead".to_string(),
        }
    }
}

impl Serialize for MessageStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// One attempt that ended in a retry or dead-letter decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEvent {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub delay_ms: u64,
    pub error: String,
    pub manual: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqMessage {
    pub id: String,
    pub payload: Value,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub dead_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_history: Vec<RetryEvent>,
}

/// How consumed items are made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailureMode {
    Always,
    Never,
    Random { probability: f64 },
    FirstN { count: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub failure_mode: FailureMode,
    /// Retry buffers in the chain (1–5).
    pub max_retries: u32,
    /// Simulated per-attempt processing latency.
    pub processing_delay_ms: u64,
    /// First retry buffer delay; buffer `k` holds items for
    /// `retry_base_delay_ms * 4^(k-1)`.
    pub retry_base_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::Random { probability: 0.5 },
            max_retries: 3,
            processing_delay_ms: 100,
            retry_base_delay_ms: 2_000,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.max_retries) {
            return Err(FaultLineError::Config(
                "max_retries must be between 1 and 5".to_string(),
            ));
        }
        if self.retry_base_delay_ms == 0 {
            return Err(FaultLineError::Config(
                "retry_base_delay_ms must be positive".to_string(),
            ));
        }
        if let FailureMode::Random { probability } = self.failure_mode {
            if !(0.0..=1.0).contains(&probability) {
                return Err(FaultLineError::Config(
                    "probability must be within 0.0..=1.0".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Delay served by retry buffer `k` (1-based): 2s, 8s, 32s with the
    /// default base.
    pub fn retry_delay_ms(&self, k: u32) -> u64 {
        self.retry_base_delay_ms.saturating_mul(4u64.saturating_pow(k.saturating_sub(1)))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub running: bool,
    pub work_queue_depth: usize,
    /// Depth of retry buffer `k` at index `k - 1`.
    pub retry_queue_depths: Vec<usize>,
    pub parked_depth: usize,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_status_serializes_with_attempt_suffix() {
        let json = serde_json::to_value(MessageStatus::Retry(2)).unwrap();
        assert_eq!(json, serde_json::json!("retry_2"));
        assert_eq!(serde_json::to_value(MessageStatus::Dead).unwrap(), serde_json::json!("dead"));
    }

    #[test]
    fn retry_delays_are_exponential() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry_delay_ms(1), 2_000);
        assert_eq!(config.retry_delay_ms(2), 8_000);
        assert_eq!(config.retry_delay_ms(3), 32_000);
    }

    #[test]
    fn config_bounds_are_enforced() {
        let mut config = PipelineConfig::default();
        config.max_retries = 0;
        assert!(config.validate().is_err());
        config.max_retries = 6;
        assert!(config.validate().is_err());
        config.max_retries = 5;
        assert!(config.validate().is_ok());

        config.failure_mode = FailureMode::Random { probability: 1.5 };
        assert!(config.validate().is_err());
    }
}
