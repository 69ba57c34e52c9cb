//! Circuit breaker engine.
//!
//! Guards a protected operation: trips open on a failure burst inside a
//! sliding window, probes recovery after a cooldown, optionally serves a
//! fallback while open.

pub mod breaker;

pub use breaker::{
    BreakerConfig, BreakerConfigUpdate, BreakerStatus, CallOutcome, CallRecord, CircuitBreaker,
    CircuitState,
};
