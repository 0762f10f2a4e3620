//! Test doubles shared by the scheduler's unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use timecapsule_core::error::{CapsuleError, Result};
use timecapsule_core::{
    Attachment, Capsule, CapsulePatch, CapsuleStatus, CapsuleStore, DeliveryGateway,
};

use crate::store::MemoryStore;

/// Pending capsule with fixed content, scheduled at `at`.
pub fn capsule_at(id: &str, at: DateTime<Utc>) -> Capsule {
    Capsule::new(
        id,
        format!("{id}@example.com"),
        "Hello from the past",
        "Remember this?",
        at,
        vec![],
    )
}

/// Gateway that records every attempt and can be told to fail.
#[derive(Default)]
pub struct RecordingGateway {
    attempts: AtomicUsize,
    sent: Mutex<Vec<String>>,
    fail_all: bool,
    fail_for: HashSet<String>,
    delay: Option<Duration>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send fails.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Sends to `recipient` fail, everything else succeeds.
    pub fn failing_for(recipient: &str) -> Self {
        Self {
            fail_for: HashSet::from([recipient.to_string()]),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryGateway for RecordingGateway {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(
        &self,
        recipient: &str,
        _subject: &str,
        _body: &str,
        _attachments: &[Attachment],
    ) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all || self.fail_for.contains(recipient) {
            return Err(CapsuleError::Delivery("mailbox refused".into()));
        }
        self.sent.lock().unwrap().push(recipient.to_string());
        Ok(())
    }
}

/// Store that stalls before every `update` and `delete`, widening the window
/// in which a timer or sweep can act on the same capsule.
pub struct SlowStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

impl SlowStore {
    pub fn new(inner: Arc<MemoryStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl CapsuleStore for SlowStore {
    async fn create(&self, capsule: Capsule) -> Result<Capsule> {
        self.inner.create(capsule).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Capsule>> {
        self.inner.find_by_id(id).await
    }

    async fn find_all(&self) -> Result<Vec<Capsule>> {
        self.inner.find_all().await
    }

    async fn update(
        &self,
        id: &str,
        expected: CapsuleStatus,
        patch: CapsulePatch,
    ) -> Result<Capsule> {
        tokio::time::sleep(self.delay).await;
        self.inner.update(id, expected, patch).await
    }

    async fn transition(
        &self,
        id: &str,
        from: CapsuleStatus,
        to: CapsuleStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        self.inner.transition(id, from, to, error).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(id).await
    }
}
