//! Reconciliation Sweep — the durability backstop for in-memory timers.
//!
//! Scans the store for Pending capsules whose time has come and drives the
//! Delivery Processor for each, concurrently. It never consults the timer
//! registry, so it recovers capsules whose timer was lost in a restart or
//! never armed. One capsule's failure does not stop the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use timecapsule_core::CapsuleStore;
use timecapsule_core::error::Result;

use crate::processor::DeliveryProcessor;

/// Aggregate result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Due capsules considered.
    pub processed: usize,
    /// Delivered, or found already resolved.
    pub successes: usize,
    pub failures: usize,
}

pub struct ReconciliationSweep {
    store: Arc<dyn CapsuleStore>,
    processor: Arc<DeliveryProcessor>,
    concurrency: usize,
}

impl ReconciliationSweep {
    pub fn new(processor: Arc<DeliveryProcessor>, concurrency: usize) -> Self {
        Self {
            store: Arc::clone(processor.store()),
            processor,
            concurrency: concurrency.max(1),
        }
    }

    /// Process every Pending capsule scheduled at or before `now`.
    ///
    /// Only a failure to list the store aborts the sweep; per-capsule errors
    /// are counted in the report.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let due: Vec<String> = self
            .store
            .find_all()
            .await?
            .into_iter()
            .filter(|c| c.is_due(now))
            .map(|c| c.id)
            .collect();

        if due.is_empty() {
            tracing::debug!("🧹 Sweep: nothing due");
            return Ok(SweepReport::default());
        }

        tracing::info!("🧹 Sweep: {} capsule(s) due", due.len());
        let processor = &self.processor;
        let results: Vec<(String, bool)> = futures::stream::iter(due)
            .map(|id| async move {
                match processor.process(&id).await {
                    Ok(_) => (id, true),
                    Err(e) => {
                        tracing::warn!("⚠️ Sweep: capsule {} failed: {}", id, e);
                        (id, false)
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let successes = results.iter().filter(|(_, ok)| *ok).count();
        let report = SweepReport {
            processed: results.len(),
            successes,
            failures: results.len() - successes,
        };
        tracing::info!(
            "🧹 Sweep done: processed={} successes={} failures={}",
            report.processed,
            report.successes,
            report.failures
        );
        Ok(report)
    }
}

/// Run the sweep every `interval` until the task is dropped.
pub async fn spawn_sweeper(sweep: Arc<ReconciliationSweep>, interval: Duration) {
    tracing::info!("🧹 Reconciliation sweeper started (every {}s)", interval.as_secs());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Err(e) = sweep.sweep(Utc::now()).await {
            tracing::error!("💥 Sweep failed: {e}");
        }
    }
}
