pub mod bounded;
pub mod tasks;

pub use bounded::BoundedLog;
pub use tasks::TaskRegistry;

/// Generate a fresh message/record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FaultLineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, FaultLineError>;
