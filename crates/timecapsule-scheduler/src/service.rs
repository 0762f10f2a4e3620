//! Capsule Service — the entry point for creating and editing capsules.
//!
//! Keeps the store and the timer registry in step: every write that changes
//! when (or whether) a capsule should be delivered also arms or cancels its
//! timer.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use timecapsule_core::error::{CapsuleError, Result};
use timecapsule_core::{Attachment, Capsule, CapsulePatch, CapsuleStatus, CapsuleStore};

use crate::timers::TaskScheduler;

static EMAIL_RE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$"));

/// Request to create a capsule.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCapsule {
    pub recipient: String,
    pub subject: String,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Partial edit. Absent fields stay as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapsuleUpdate {
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attachments: Option<Vec<Attachment>>,
}

pub struct CapsuleService {
    store: Arc<dyn CapsuleStore>,
    scheduler: TaskScheduler,
}

impl CapsuleService {
    pub fn new(scheduler: TaskScheduler) -> Self {
        Self {
            store: Arc::clone(scheduler.processor().store()),
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub async fn create(&self, req: NewCapsule) -> Result<Capsule> {
        let recipient = validate_recipient(&req.recipient)?;
        let subject = non_empty("subject", &req.subject)?;
        let message = non_empty("message", &req.message)?;
        validate_future(req.scheduled_at)?;

        let capsule = Capsule::new(
            uuid::Uuid::new_v4().to_string(),
            recipient,
            subject,
            message,
            req.scheduled_at,
            req.attachments,
        );
        let capsule = self.store.create(capsule).await?;
        tracing::info!(
            "💊 Capsule {} created for {} at {}",
            capsule.id,
            capsule.recipient,
            capsule.scheduled_at
        );

        self.scheduler.arm(&capsule.id, capsule.scheduled_at).await;
        Ok(capsule)
    }

    pub async fn get(&self, id: &str) -> Result<Capsule> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| CapsuleError::NotFound(id.to_string()))
    }

    /// All capsules, earliest delivery first.
    pub async fn list(&self) -> Result<Vec<Capsule>> {
        self.store.find_all().await
    }

    pub async fn update(&self, id: &str, req: CapsuleUpdate) -> Result<Capsule> {
        let current = self.get(id).await?;

        let mut patch = CapsulePatch {
            recipient: req.recipient.as_deref().map(validate_recipient).transpose()?,
            subject: req
                .subject
                .as_deref()
                .map(|s| non_empty("subject", s))
                .transpose()?,
            message: req
                .message
                .as_deref()
                .map(|s| non_empty("message", s))
                .transpose()?,
            ..CapsulePatch::default()
        };
        let reschedule = req.scheduled_at.filter(|at| *at != current.scheduled_at);
        if let Some(at) = reschedule {
            validate_future(at)?;
        }

        match current.status {
            CapsuleStatus::Sent => return Err(sent_is_frozen(id)),
            CapsuleStatus::Sending => {
                return Err(CapsuleError::ConcurrencyConflict(id.to_string()));
            }
            CapsuleStatus::Pending => {
                patch.attachments = req.attachments;
            }
            CapsuleStatus::Failed => {
                if reschedule.is_some() {
                    patch.attachments = req.attachments;
                    patch.status = Some(CapsuleStatus::Pending);
                    patch.last_error = Some(None);
                } else if req.attachments.is_some() {
                    return Err(CapsuleError::Validation(
                        "attachments of a failed capsule can only change together with a new delivery time"
                            .into(),
                    ));
                }
            }
        }
        patch.scheduled_at = reschedule;

        // The old timer must not fire while the new time is being written.
        if reschedule.is_some() {
            self.scheduler.cancel(id);
        }
        let updated = match self.store.update(id, current.status, patch).await {
            Ok(c) => c,
            Err(e) => {
                self.rearm_if_pending(id).await;
                return Err(self.explain_conflict(id, e).await);
            }
        };
        if reschedule.is_some() {
            self.scheduler.arm(id, updated.scheduled_at).await;
            tracing::info!("📅 Capsule {} rescheduled to {}", id, updated.scheduled_at);
        } else {
            tracing::info!("✏️ Capsule {} updated", id);
        }
        Ok(updated)
    }

    /// Delete a capsule and its timer. A capsule in the middle of delivery
    /// cannot be deleted.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.scheduler.cancel(id);
        match self.store.delete(id).await {
            Ok(true) => {
                tracing::info!("🗑️ Capsule {} deleted", id);
                Ok(())
            }
            Ok(false) => Err(CapsuleError::NotFound(id.to_string())),
            Err(e) => {
                self.rearm_if_pending(id).await;
                Err(e)
            }
        }
    }

    /// Startup recovery: release stale claims, then re-arm every Pending
    /// capsule that is still in the future.
    ///
    /// Overdue capsules are left to the reconciliation sweep, which delivers
    /// them concurrently. Returns the number of timers armed.
    pub async fn restore(&self) -> Result<usize> {
        let capsules = self.store.find_all().await?;

        let mut released = 0usize;
        for c in capsules.iter().filter(|c| c.status == CapsuleStatus::Sending) {
            if self
                .store
                .transition(&c.id, CapsuleStatus::Sending, CapsuleStatus::Pending, None)
                .await?
            {
                released += 1;
            }
        }
        if released > 0 {
            tracing::warn!("♻️ Released {} capsule(s) stuck in sending", released);
        }

        let now = Utc::now();
        let mut armed = 0usize;
        let mut overdue = 0usize;
        for c in capsules
            .iter()
            .filter(|c| matches!(c.status, CapsuleStatus::Pending | CapsuleStatus::Sending))
        {
            if c.scheduled_at > now {
                self.scheduler.arm(&c.id, c.scheduled_at).await;
                armed += 1;
            } else {
                overdue += 1;
            }
        }
        tracing::info!(
            "♻️ Restored {} timer(s), {} overdue capsule(s) left for the sweep",
            armed,
            overdue
        );
        Ok(armed)
    }

    /// Put the timer back after a failed write, if the capsule still waits.
    async fn rearm_if_pending(&self, id: &str) {
        if let Ok(Some(c)) = self.store.find_by_id(id).await
            && c.status == CapsuleStatus::Pending
            && !self.scheduler.is_armed(id)
        {
            self.scheduler.arm(id, c.scheduled_at).await;
        }
    }

    /// A lost compare-and-set on a capsule that has since been delivered is a
    /// validation error, like editing any Sent capsule.
    async fn explain_conflict(&self, id: &str, err: CapsuleError) -> CapsuleError {
        if !matches!(err, CapsuleError::ConcurrencyConflict(_)) {
            return err;
        }
        match self.store.find_by_id(id).await {
            Ok(Some(c)) if c.status == CapsuleStatus::Sent => sent_is_frozen(id),
            _ => err,
        }
    }
}

fn sent_is_frozen(id: &str) -> CapsuleError {
    CapsuleError::Validation(format!(
        "capsule {id} was already delivered and can no longer be edited"
    ))
}

fn non_empty(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CapsuleError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn validate_recipient(value: &str) -> Result<String> {
    let recipient = non_empty("recipient", value)?;
    let re = EMAIL_RE
        .as_ref()
        .map_err(|e| CapsuleError::Validation(e.to_string()))?;
    if !re.is_match(&recipient) {
        return Err(CapsuleError::Validation(format!(
            "invalid recipient email '{recipient}'"
        )));
    }
    Ok(recipient)
}

fn validate_future(at: DateTime<Utc>) -> Result<()> {
    if at <= Utc::now() {
        return Err(CapsuleError::Validation(
            "scheduled_at must be in the future".into(),
        ));
    }
    Ok(())
}
