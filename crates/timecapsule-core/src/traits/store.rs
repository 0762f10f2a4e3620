//! Capsule Store trait — durable record of capsules.

use async_trait::async_trait;

use crate::capsule::{Capsule, CapsulePatch, CapsuleStatus};
use crate::error::Result;

/// Persistence contract consumed by the scheduler, processor and sweep.
#[async_trait]
pub trait CapsuleStore: Send + Sync {
    /// Insert a new capsule and return it as stored.
    async fn create(&self, capsule: Capsule) -> Result<Capsule>;

    /// Look a capsule up by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<Capsule>>;

    /// All capsules, ordered by `scheduled_at` ascending.
    async fn find_all(&self) -> Result<Vec<Capsule>>;

    /// Apply a partial update, but only while the capsule is still in
    /// `expected` status. Fails with `NotFound` for unknown ids and with
    /// `ConcurrencyConflict` when the status has moved on.
    async fn update(
        &self,
        id: &str,
        expected: CapsuleStatus,
        patch: CapsulePatch,
    ) -> Result<Capsule>;

    /// Atomically move `id` from `from` to `to`.
    ///
    /// Returns `false` without touching the record when the current status is
    /// not `from` (or the capsule is gone). Reaching `Sent` stamps
    /// `delivered_at`; `error` replaces `last_error`.
    async fn transition(
        &self,
        id: &str,
        from: CapsuleStatus,
        to: CapsuleStatus,
        error: Option<&str>,
    ) -> Result<bool>;

    /// Remove a capsule. Returns `false` if it did not exist. A capsule that
    /// is `Sending` is left in place and reported as `ConcurrencyConflict`.
    async fn delete(&self, id: &str) -> Result<bool>;
}
