//! Delivery Gateway trait — sends a capsule's message to its recipient.

use async_trait::async_trait;

use crate::capsule::Attachment;
use crate::error::Result;

#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    /// Gateway name (for logging).
    fn name(&self) -> &str;

    /// Send one message. Any failure is reported as `CapsuleError::Delivery`.
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<()>;
}
