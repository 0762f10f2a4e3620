//! Trait seams the delivery core depends on.

pub mod gateway;
pub mod store;

pub use gateway::DeliveryGateway;
pub use store::CapsuleStore;
