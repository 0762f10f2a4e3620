//! In-memory capsule store — for tests and ephemeral runs.
//! Nothing survives a restart; use `SqliteStore` for real deployments.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use timecapsule_core::error::{CapsuleError, Result};
use timecapsule_core::{Capsule, CapsulePatch, CapsuleStatus, CapsuleStore};
use tokio::sync::RwLock;

/// HashMap-backed store. Every operation holds the lock for its whole
/// read-modify-write, so `transition` is atomic.
#[derive(Default)]
pub struct MemoryStore {
    capsules: RwLock<HashMap<String, Capsule>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored capsules.
    pub async fn len(&self) -> usize {
        self.capsules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.capsules.read().await.is_empty()
    }
}

#[async_trait]
impl CapsuleStore for MemoryStore {
    async fn create(&self, capsule: Capsule) -> Result<Capsule> {
        let mut capsules = self.capsules.write().await;
        if capsules.contains_key(&capsule.id) {
            return Err(CapsuleError::Store(format!(
                "Capsule {} already exists",
                capsule.id
            )));
        }
        capsules.insert(capsule.id.clone(), capsule.clone());
        Ok(capsule)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Capsule>> {
        Ok(self.capsules.read().await.get(id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<Capsule>> {
        let mut all: Vec<Capsule> = self.capsules.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(all)
    }

    async fn update(
        &self,
        id: &str,
        expected: CapsuleStatus,
        patch: CapsulePatch,
    ) -> Result<Capsule> {
        let mut capsules = self.capsules.write().await;
        let capsule = capsules
            .get_mut(id)
            .ok_or_else(|| CapsuleError::NotFound(id.to_string()))?;
        if capsule.status != expected {
            return Err(CapsuleError::ConcurrencyConflict(id.to_string()));
        }
        patch.apply_to(capsule);
        Ok(capsule.clone())
    }

    async fn transition(
        &self,
        id: &str,
        from: CapsuleStatus,
        to: CapsuleStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let mut capsules = self.capsules.write().await;
        let Some(capsule) = capsules.get_mut(id) else {
            return Ok(false);
        };
        if capsule.status != from {
            return Ok(false);
        }
        let now = Utc::now();
        capsule.status = to;
        capsule.updated_at = now;
        capsule.last_error = error.map(str::to_string);
        if to == CapsuleStatus::Sent {
            capsule.delivered_at = Some(now);
        }
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut capsules = self.capsules.write().await;
        match capsules.get(id) {
            None => Ok(false),
            Some(c) if c.status == CapsuleStatus::Sending => {
                Err(CapsuleError::ConcurrencyConflict(id.to_string()))
            }
            Some(_) => Ok(capsules.remove(id).is_some()),
        }
    }
}
