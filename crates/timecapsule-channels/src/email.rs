//! SMTP gateway — delivers capsules as email via async lettre.
//!
//! Plain capsules go out as a single text/plain part; capsules with
//! attachments become multipart/mixed with one part per attachment.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use timecapsule_core::Attachment;
use timecapsule_core::DeliveryGateway;
use timecapsule_core::config::{DeliveryConfig, SmtpConfig};
use timecapsule_core::error::{CapsuleError, Result};

use crate::attachments::{AttachmentLoader, LoadedAttachment};

/// Email delivery over SMTP (STARTTLS relay).
pub struct SmtpGateway {
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    loader: AttachmentLoader,
}

impl SmtpGateway {
    pub fn new(config: SmtpConfig, delivery: DeliveryConfig) -> Result<Self> {
        let from = sender_mailbox(&config)?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| CapsuleError::Config(format!("SMTP relay: {e}")))?
            .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        tracing::info!(
            "📧 SMTP gateway ready: {}:{} as {}",
            config.host,
            config.port,
            config.sender()
        );

        Ok(Self {
            from,
            mailer: builder.build(),
            loader: AttachmentLoader::new(delivery.max_attachment_bytes)?,
        })
    }
}

fn sender_mailbox(config: &SmtpConfig) -> Result<Mailbox> {
    let sender = config.sender();
    if sender.is_empty() {
        return Err(CapsuleError::Config(
            "smtp.from or smtp.username must be set".into(),
        ));
    }
    let raw = match &config.display_name {
        Some(name) => format!("{name} <{sender}>"),
        None => sender.to_string(),
    };
    raw.parse()
        .map_err(|e| CapsuleError::Config(format!("Invalid from: {e}")))
}

/// Build the outgoing message.
pub(crate) fn build_message(
    from: &Mailbox,
    to: &str,
    subject: &str,
    body: &str,
    attachments: Vec<LoadedAttachment>,
) -> Result<LettreMessage> {
    let to_mailbox: Mailbox = to
        .parse()
        .map_err(|e| CapsuleError::Delivery(format!("Invalid to: {e}")))?;

    let builder = LettreMessage::builder()
        .from(from.clone())
        .to(to_mailbox)
        .subject(subject);

    let message = if attachments.is_empty() {
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
    } else {
        let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(body.to_string()));
        for attachment in attachments {
            let content_type = match ContentType::parse(&attachment.content_type) {
                Ok(ct) => ct,
                Err(_) => ContentType::parse("application/octet-stream")
                    .map_err(|e| CapsuleError::Delivery(format!("Content type: {e}")))?,
            };
            multipart = multipart
                .singlepart(MailAttachment::new(attachment.name).body(attachment.bytes, content_type));
        }
        builder.multipart(multipart)
    };

    message.map_err(|e| CapsuleError::Delivery(format!("Build email: {e}")))
}

#[async_trait]
impl DeliveryGateway for SmtpGateway {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<()> {
        let loaded = self.loader.load_all(attachments).await?;
        let email = build_message(&self.from, recipient, subject, body, loaded)?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| CapsuleError::Delivery(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Email sent to: {recipient}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from() -> Mailbox {
        "Capsule Bot <bot@example.com>".parse().unwrap()
    }

    #[test]
    fn test_plain_message() {
        let msg = build_message(&from(), "friend@example.com", "Hello", "Future you", vec![])
            .unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("Subject: Hello"));
        assert!(raw.contains("To: friend@example.com"));
        assert!(raw.contains("Future you"));
        assert!(!raw.contains("multipart/mixed"));
    }

    #[test]
    fn test_message_with_attachment() {
        let attachment = LoadedAttachment {
            name: "photo.png".into(),
            content_type: "image/png".into(),
            bytes: vec![0x89, b'P', b'N', b'G'],
        };
        let msg = build_message(&from(), "friend@example.com", "Pics", "See attached", vec![attachment])
            .unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("photo.png"));
        assert!(raw.contains("image/png"));
    }

    #[test]
    fn test_invalid_recipient() {
        let err = build_message(&from(), "not-an-address", "x", "y", vec![]).unwrap_err();
        assert_eq!(err.kind(), "delivery_error");
    }

    #[test]
    fn test_sender_required() {
        let config = SmtpConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(sender_mailbox(&config).is_err());

        let config = SmtpConfig {
            from: "capsules@example.com".into(),
            display_name: Some("Time Capsule".into()),
            ..Default::default()
        };
        let mailbox = sender_mailbox(&config).unwrap();
        assert_eq!(mailbox.email.to_string(), "capsules@example.com");
    }
}
