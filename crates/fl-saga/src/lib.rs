//! Saga orchestrator engine.
//!
//! Runs the ordered steps of one logical transaction; the first failure
//! stops forward progress and unwinds every completed step with its
//! compensating action, in reverse completion order.

pub mod orchestrator;

pub use orchestrator::{
    SagaOptions, SagaOrchestrator, SagaOutcome, SagaResult, SagaStep, StepStatus,
};
