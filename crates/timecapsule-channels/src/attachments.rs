//! Attachment loading — resolves descriptors to bytes right before sending.
//! Remote locations (`http://`, `https://`) are downloaded, anything else is
//! read from the local filesystem.

use std::time::Duration;

use timecapsule_core::Attachment;
use timecapsule_core::error::{CapsuleError, Result};

/// An attachment with its content loaded.
#[derive(Debug, Clone)]
pub struct LoadedAttachment {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Fetches attachment content with a size ceiling.
pub struct AttachmentLoader {
    client: reqwest::Client,
    max_bytes: u64,
}

impl AttachmentLoader {
    pub fn new(max_bytes: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CapsuleError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, max_bytes })
    }

    /// Load every attachment in order. The first failure aborts the batch.
    pub async fn load_all(&self, attachments: &[Attachment]) -> Result<Vec<LoadedAttachment>> {
        let mut loaded = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            loaded.push(self.load(attachment).await?);
        }
        Ok(loaded)
    }

    pub async fn load(&self, attachment: &Attachment) -> Result<LoadedAttachment> {
        if attachment.size > self.max_bytes {
            return Err(too_large(&attachment.name, attachment.size, self.max_bytes));
        }

        let bytes = if is_remote(&attachment.location) {
            self.download(attachment).await?
        } else {
            tokio::fs::read(&attachment.location).await.map_err(|e| {
                CapsuleError::Delivery(format!(
                    "Attachment '{}' unreadable at {}: {e}",
                    attachment.name, attachment.location
                ))
            })?
        };

        if bytes.len() as u64 > self.max_bytes {
            return Err(too_large(&attachment.name, bytes.len() as u64, self.max_bytes));
        }

        tracing::debug!("📎 Loaded attachment '{}' ({} bytes)", attachment.name, bytes.len());
        Ok(LoadedAttachment {
            name: attachment.name.clone(),
            content_type: attachment.content_type.clone(),
            bytes,
        })
    }

    async fn download(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        let mut resp = self
            .client
            .get(&attachment.location)
            .send()
            .await
            .map_err(|e| {
                CapsuleError::Delivery(format!("Attachment '{}' download: {e}", attachment.name))
            })?;

        if !resp.status().is_success() {
            return Err(CapsuleError::Delivery(format!(
                "Attachment '{}' download: HTTP {}",
                attachment.name,
                resp.status()
            )));
        }

        if let Some(len) = resp.content_length()
            && len > self.max_bytes
        {
            return Err(too_large(&attachment.name, len, self.max_bytes));
        }

        // Length headers can be absent or wrong; enforce the limit while reading.
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| {
            CapsuleError::Delivery(format!("Attachment '{}' body: {e}", attachment.name))
        })? {
            append_limited(&mut body, &chunk, &attachment.name, self.max_bytes)?;
        }
        Ok(body)
    }
}

fn append_limited(body: &mut Vec<u8>, chunk: &[u8], name: &str, max: u64) -> Result<()> {
    let total = (body.len() + chunk.len()) as u64;
    if total > max {
        return Err(too_large(name, total, max));
    }
    body.extend_from_slice(chunk);
    Ok(())
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn too_large(name: &str, size: u64, max: u64) -> CapsuleError {
    CapsuleError::Delivery(format!(
        "Attachment '{name}' is {size} bytes, limit is {max}"
    ))
}
