//! # Time Capsule Core
//!
//! Shared building blocks for the Time Capsule workspace: the capsule data
//! model, the error taxonomy, the configuration system, and the two seams the
//! delivery core depends on (`CapsuleStore`, `DeliveryGateway`).

pub mod capsule;
pub mod config;
pub mod error;
pub mod traits;

pub use capsule::{Attachment, Capsule, CapsulePatch, CapsuleStatus, ProcessOutcome};
pub use config::AppConfig;
pub use error::{CapsuleError, Result};
pub use traits::{CapsuleStore, DeliveryGateway};
