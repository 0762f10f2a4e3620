//! Dry-run gateway — records deliveries in the log instead of sending them.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use timecapsule_core::Attachment;
use timecapsule_core::DeliveryGateway;
use timecapsule_core::error::Result;

/// Always succeeds. Counts deliveries so callers can report on them.
#[derive(Default)]
pub struct DryRunGateway {
    delivered: AtomicU64,
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages "sent" so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeliveryGateway for DryRunGateway {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "📭 [dry-run] to={} subject='{}' body_len={} attachments={}",
            recipient,
            subject,
            body.len(),
            attachments.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_deliveries() {
        let gw = DryRunGateway::new();
        gw.send("a@b.io", "s", "b", &[]).await.unwrap();
        gw.send("a@b.io", "s", "b", &[]).await.unwrap();
        assert_eq!(gw.delivered(), 2);
        assert_eq!(gw.name(), "dry-run");
    }
}
