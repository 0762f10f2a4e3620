//! # Time Capsule Channels
//! Delivery gateway implementations.
//!
//! - `SmtpGateway`: async SMTP via lettre, attachments fetched at send time
//! - `DryRunGateway`: logs instead of sending (SMTP disabled, local runs)

pub mod attachments;
pub mod dry_run;
pub mod email;

pub use dry_run::DryRunGateway;
pub use email::SmtpGateway;

use std::sync::Arc;
use timecapsule_core::DeliveryGateway;
use timecapsule_core::config::{DeliveryConfig, SmtpConfig};
use timecapsule_core::error::Result;

/// Build the gateway selected by config: SMTP when enabled, dry run otherwise.
pub fn gateway_from_config(
    smtp: &SmtpConfig,
    delivery: &DeliveryConfig,
) -> Result<Arc<dyn DeliveryGateway>> {
    if smtp.enabled {
        Ok(Arc::new(SmtpGateway::new(smtp.clone(), delivery.clone())?))
    } else {
        tracing::warn!("⚠️ SMTP disabled — capsules will be logged, not emailed");
        Ok(Arc::new(DryRunGateway::new()))
    }
}
