//! Capsule definitions — the core data model for deferred delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message scheduled for delivery at a future moment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capsule {
    /// Unique capsule ID. Never changes.
    pub id: String,
    /// Recipient email address.
    pub recipient: String,
    pub subject: String,
    /// Plain-text body.
    pub message: String,
    /// When the capsule should be delivered.
    pub scheduled_at: DateTime<Utc>,
    /// Current delivery status.
    pub status: CapsuleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the capsule reaches `Sent`.
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Reason of the last failed delivery attempt.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Ordered attachment descriptors.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Attachment descriptor. The bytes live elsewhere (blob store or local disk).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    /// File name presented to the recipient.
    pub name: String,
    /// `http(s)://` URL or local file path.
    pub location: String,
    /// Size in bytes, as reported at upload time.
    #[serde(default)]
    pub size: u64,
    /// MIME type, e.g. `application/pdf`.
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "application/octet-stream".into()
}

/// Capsule delivery status.
///
/// `Pending` waits for its time, `Sending` marks a claimed in-flight attempt,
/// `Sent` and `Failed` are terminal for automatic processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CapsuleStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl CapsuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapsuleStatus::Pending => "pending",
            CapsuleStatus::Sending => "sending",
            CapsuleStatus::Sent => "sent",
            CapsuleStatus::Failed => "failed",
        }
    }

    /// Sent or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CapsuleStatus::Sent | CapsuleStatus::Failed)
    }
}

impl std::fmt::Display for CapsuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CapsuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CapsuleStatus::Pending),
            "sending" => Ok(CapsuleStatus::Sending),
            "sent" => Ok(CapsuleStatus::Sent),
            "failed" => Ok(CapsuleStatus::Failed),
            other => Err(format!("unknown capsule status '{other}'")),
        }
    }
}

/// Partial update applied by `CapsuleStore::update`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct CapsulePatch {
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attachments: Option<Vec<Attachment>>,
    pub status: Option<CapsuleStatus>,
    /// `Some(None)` clears the stored error.
    pub last_error: Option<Option<String>>,
}

impl CapsulePatch {
    /// Apply this patch in place and bump `updated_at`.
    pub fn apply_to(&self, capsule: &mut Capsule) {
        if let Some(v) = &self.recipient {
            capsule.recipient = v.clone();
        }
        if let Some(v) = &self.subject {
            capsule.subject = v.clone();
        }
        if let Some(v) = &self.message {
            capsule.message = v.clone();
        }
        if let Some(v) = self.scheduled_at {
            capsule.scheduled_at = v;
        }
        if let Some(v) = &self.attachments {
            capsule.attachments = v.clone();
        }
        if let Some(v) = self.status {
            capsule.status = v;
        }
        if let Some(v) = &self.last_error {
            capsule.last_error = v.clone();
        }
        capsule.updated_at = Utc::now();
    }
}

/// Result of a successful `DeliveryProcessor::process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "status")]
pub enum ProcessOutcome {
    /// This call delivered the capsule.
    Sent,
    /// Nothing to do: the capsule was not Pending (or another caller claimed it).
    AlreadyResolved(CapsuleStatus),
    /// Still Pending but rescheduled into the future; left for its new timer.
    NotDue,
}

impl Capsule {
    /// Create a new Pending capsule with a fresh timestamp. The caller supplies the id.
    pub fn new(
        id: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        attachments: Vec<Attachment>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            message: message.into(),
            scheduled_at,
            status: CapsuleStatus::Pending,
            created_at: now,
            updated_at: now,
            delivered_at: None,
            last_error: None,
            attachments,
        }
    }

    /// Pending and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CapsuleStatus::Pending && self.scheduled_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(at: DateTime<Utc>) -> Capsule {
        Capsule::new("c1", "a@b.io", "Hi", "Body", at, vec![])
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        assert!(sample(now - Duration::seconds(5)).is_due(now));
        assert!(!sample(now + Duration::seconds(5)).is_due(now));

        let mut sent = sample(now - Duration::seconds(5));
        sent.status = CapsuleStatus::Sent;
        assert!(!sent.is_due(now));
    }

    #[test]
    fn test_status_round_trip_text() {
        for s in [
            CapsuleStatus::Pending,
            CapsuleStatus::Sending,
            CapsuleStatus::Sent,
            CapsuleStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<CapsuleStatus>().unwrap(), s);
        }
        assert!("queued".parse::<CapsuleStatus>().is_err());
        assert!(CapsuleStatus::Failed.is_terminal());
        assert!(!CapsuleStatus::Sending.is_terminal());
    }

    #[test]
    fn test_patch_applies_only_set_fields() {
        let mut c = sample(Utc::now());
        c.last_error = Some("boom".into());
        let patch = CapsulePatch {
            subject: Some("New subject".into()),
            last_error: Some(None),
            ..Default::default()
        };
        patch.apply_to(&mut c);
        assert_eq!(c.subject, "New subject");
        assert_eq!(c.message, "Body");
        assert!(c.last_error.is_none());
    }

    #[test]
    fn test_attachment_defaults() {
        let a: Attachment =
            serde_json::from_str(r#"{"name":"a.txt","location":"/tmp/a.txt"}"#).unwrap();
        assert_eq!(a.size, 0);
        assert_eq!(a.content_type, "application/octet-stream");
    }
}
