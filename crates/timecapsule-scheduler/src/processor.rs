//! Delivery Processor — claim a Pending capsule, send it, record the outcome.
//!
//! Idempotent: calling `process` again for a capsule that is no longer
//! Pending is a successful no-op and never reaches the gateway. Concurrent
//! callers (a timer fire racing a sweep) are serialized by the store's atomic
//! Pending → Sending claim; only the winner sends. A capsule whose
//! `scheduled_at` is still ahead (it was rescheduled after its old timer
//! fired) is not sent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use timecapsule_core::error::{CapsuleError, Result};
use timecapsule_core::{CapsuleStatus, CapsuleStore, DeliveryGateway, ProcessOutcome};

pub struct DeliveryProcessor {
    store: Arc<dyn CapsuleStore>,
    gateway: Arc<dyn DeliveryGateway>,
    timeout: Option<Duration>,
}

impl DeliveryProcessor {
    /// Processor without a gateway timeout.
    pub fn new(store: Arc<dyn CapsuleStore>, gateway: Arc<dyn DeliveryGateway>) -> Self {
        Self {
            store,
            gateway,
            timeout: None,
        }
    }

    /// Bound every gateway call. A timed-out attempt counts as a delivery failure.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn CapsuleStore> {
        &self.store
    }

    /// Attempt delivery of capsule `id`.
    pub async fn process(&self, id: &str) -> Result<ProcessOutcome> {
        let capsule = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| CapsuleError::NotFound(id.to_string()))?;

        if capsule.status != CapsuleStatus::Pending {
            tracing::debug!("⏭️ Capsule {} already {}, skipping", id, capsule.status);
            return Ok(ProcessOutcome::AlreadyResolved(capsule.status));
        }
        if capsule.scheduled_at > Utc::now() {
            tracing::debug!("⏭️ Capsule {} not due until {}", id, capsule.scheduled_at);
            return Ok(ProcessOutcome::NotDue);
        }

        let claimed = self
            .store
            .transition(id, CapsuleStatus::Pending, CapsuleStatus::Sending, None)
            .await?;
        if !claimed {
            let current = self
                .store
                .find_by_id(id)
                .await?
                .ok_or_else(|| CapsuleError::NotFound(id.to_string()))?;
            tracing::debug!("⏭️ Capsule {} claimed elsewhere (now {})", id, current.status);
            return Ok(ProcessOutcome::AlreadyResolved(current.status));
        }

        // Edits may have landed between the first read and the claim; send what
        // is stored now.
        let capsule = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| CapsuleError::NotFound(id.to_string()))?;
        if capsule.scheduled_at > Utc::now() {
            self.store
                .transition(id, CapsuleStatus::Sending, CapsuleStatus::Pending, None)
                .await?;
            tracing::debug!("⏭️ Capsule {} was rescheduled to {}", id, capsule.scheduled_at);
            return Ok(ProcessOutcome::NotDue);
        }

        tracing::info!(
            "📨 Delivering capsule {} to {} via {}",
            id,
            capsule.recipient,
            self.gateway.name()
        );

        let send = self.gateway.send(
            &capsule.recipient,
            &capsule.subject,
            &capsule.message,
            &capsule.attachments,
        );
        let sent = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, send).await {
                Ok(result) => result,
                Err(_) => Err(CapsuleError::Delivery(format!(
                    "gateway timed out after {}s",
                    limit.as_secs_f64()
                ))),
            },
            None => send.await,
        };

        match sent {
            Ok(()) => {
                self.finish(id, CapsuleStatus::Sent, None).await?;
                tracing::info!("✅ Capsule {} sent", id);
                Ok(ProcessOutcome::Sent)
            }
            Err(e) => {
                let reason = match e {
                    CapsuleError::Delivery(msg) => msg,
                    other => other.to_string(),
                };
                self.finish(id, CapsuleStatus::Failed, Some(&reason)).await?;
                tracing::warn!("❌ Capsule {} failed: {}", id, reason);
                Err(CapsuleError::Delivery(reason))
            }
        }
    }

    /// Release the claim into a terminal state.
    async fn finish(&self, id: &str, to: CapsuleStatus, error: Option<&str>) -> Result<()> {
        let done = self
            .store
            .transition(id, CapsuleStatus::Sending, to, error)
            .await
            .inspect_err(|e| {
                tracing::error!("💥 Capsule {} stuck in sending, could not record {}: {}", id, to, e)
            })?;
        if !done {
            // Deleted (or otherwise moved) while in flight; nothing left to update.
            tracing::warn!("⚠️ Capsule {} vanished before {} could be recorded", id, to);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{RecordingGateway, capsule_at};
    use chrono::{Duration as ChronoDuration, Utc};

    async fn setup(gateway: Arc<RecordingGateway>) -> (Arc<MemoryStore>, DeliveryProcessor) {
        let store = Arc::new(MemoryStore::new());
        store
            .create(capsule_at("c1", Utc::now() - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        let processor = DeliveryProcessor::new(store.clone(), gateway);
        (store, processor)
    }

    #[tokio::test]
    async fn test_second_call_is_noop() {
        let gateway = Arc::new(RecordingGateway::new());
        let (store, processor) = setup(gateway.clone()).await;

        assert_eq!(processor.process("c1").await.unwrap(), ProcessOutcome::Sent);
        assert_eq!(
            processor.process("c1").await.unwrap(),
            ProcessOutcome::AlreadyResolved(CapsuleStatus::Sent)
        );

        assert_eq!(gateway.sent_count(), 1);
        let c = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(c.status, CapsuleStatus::Sent);
        assert!(c.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_capsule() {
        let gateway = Arc::new(RecordingGateway::new());
        let (_store, processor) = setup(gateway.clone()).await;

        let err = processor.process("nope").await.unwrap_err();
        assert!(matches!(err, CapsuleError::NotFound(ref id) if id == "nope"));
        assert_eq!(gateway.attempts(), 0);
    }

    #[tokio::test]
    async fn test_gateway_failure_marks_failed() {
        let gateway = Arc::new(RecordingGateway::failing());
        let (store, processor) = setup(gateway.clone()).await;

        let err = processor.process("c1").await.unwrap_err();
        assert_eq!(err.kind(), "delivery_error");

        let c = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(c.status, CapsuleStatus::Failed);
        assert!(c.last_error.unwrap().contains("refused"));

        // No automatic retry: the next call leaves it alone.
        assert_eq!(
            processor.process("c1").await.unwrap(),
            ProcessOutcome::AlreadyResolved(CapsuleStatus::Failed)
        );
        assert_eq!(gateway.attempts(), 1);
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let gateway = Arc::new(RecordingGateway::new().with_delay(Duration::from_millis(500)));
        let (store, processor) = setup(gateway.clone()).await;
        let processor = processor.with_timeout(Some(Duration::from_millis(50)));

        let err = processor.process("c1").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        let c = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(c.status, CapsuleStatus::Failed);
    }

    #[tokio::test]
    async fn test_future_capsule_not_sent() {
        let gateway = Arc::new(RecordingGateway::new());
        let store = Arc::new(MemoryStore::new());
        store
            .create(capsule_at("later", Utc::now() + ChronoDuration::days(1)))
            .await
            .unwrap();
        let processor = DeliveryProcessor::new(store.clone(), gateway.clone());

        assert_eq!(processor.process("later").await.unwrap(), ProcessOutcome::NotDue);
        assert_eq!(gateway.attempts(), 0);
        let c = store.find_by_id("later").await.unwrap().unwrap();
        assert_eq!(c.status, CapsuleStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_calls_send_once() {
        let gateway = Arc::new(RecordingGateway::new().with_delay(Duration::from_millis(100)));
        let (store, processor) = setup(gateway.clone()).await;

        let (a, b) = tokio::join!(processor.process("c1"), processor.process("c1"));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(gateway.sent_count(), 1);
        assert_eq!(
            outcomes.iter().filter(|o| **o == ProcessOutcome::Sent).count(),
            1
        );
        let c = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(c.status, CapsuleStatus::Sent);
    }
}
