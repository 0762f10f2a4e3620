//! Error types for Time Capsule.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CapsuleError>;

/// Everything that can go wrong while storing, scheduling or delivering a capsule.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// Unknown capsule id.
    #[error("Capsule not found: {0}")]
    NotFound(String),

    /// The delivery gateway refused or failed to send.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Another worker currently owns the capsule (delivery in flight).
    #[error("Capsule {0} is being delivered right now")]
    ConcurrencyConflict(String),

    /// Rejected user input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Persistence layer failure.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CapsuleError {
    /// Short machine-friendly kind, used in API payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CapsuleError::NotFound(_) => "not_found",
            CapsuleError::Delivery(_) => "delivery_error",
            CapsuleError::ConcurrencyConflict(_) => "concurrency_conflict",
            CapsuleError::Validation(_) => "validation",
            CapsuleError::Store(_) => "store",
            CapsuleError::Config(_) => "config",
            CapsuleError::Io(_) => "io",
        }
    }
}
