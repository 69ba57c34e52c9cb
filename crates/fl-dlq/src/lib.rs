//! Retry / dead-letter pipeline engine.
//!
//! Consumes work items from a transport queue; failed attempts escalate
//! through a chain of TTL'd retry buffers with exponential delays before an
//! exhausted item is parked in the dead-letter store. Dead items can be
//! replayed or discarded by hand.

pub mod message;
pub mod pipeline;

pub use message::{DlqMessage, FailureMode, MessageStatus, PipelineConfig, PipelineStats, RetryEvent};
pub use pipeline::RetryPipeline;
