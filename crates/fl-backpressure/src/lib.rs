//! Backpressure controller engine.
//!
//! Simulates independent producer and consumer rates against a bounded
//! buffer and applies a configurable overflow policy when the producer
//! outpaces the consumer.

pub mod controller;

pub use controller::{
    BackpressureController, DropPolicy, FlowConfig, FlowConfigUpdate, FlowMessage,
    FlowMessageStatus, FlowStats, OverflowStrategy,
};
