//! # Time Capsule Scheduler
//!
//! Deferred-delivery core: an in-process timer registry, an idempotent
//! delivery processor, and a reconciliation sweep that recovers anything the
//! timers missed.
//!
//! ## Architecture
//! ```text
//! CapsuleService (create / update / delete / restore)
//!   ├── CapsuleStore (SQLite or memory) ── durable capsule records
//!   └── TaskScheduler ── at most one armed timer per capsule
//!         └── on fire → DeliveryProcessor
//!                         ├── claim: Pending → Sending
//!                         ├── DeliveryGateway::send
//!                         └── Sending → Sent | Failed
//!
//! ReconciliationSweep (HTTP cron, CLI, periodic loop)
//!   └── Pending && scheduled_at <= now → DeliveryProcessor (concurrently)
//! ```
//!
//! Timers are not persisted. After a restart `CapsuleService::restore`
//! re-arms every Pending capsule and the sweep catches anything overdue.

pub mod persistence;
pub mod processor;
pub mod service;
pub mod store;
pub mod sweep;
pub mod timers;

#[cfg(test)]
pub(crate) mod testing;

pub use persistence::SqliteStore;
pub use processor::DeliveryProcessor;
pub use service::{CapsuleService, CapsuleUpdate, NewCapsule};
pub use store::MemoryStore;
pub use sweep::{ReconciliationSweep, SweepReport, spawn_sweeper};
pub use timers::{DeliveryTicket, TaskScheduler};
