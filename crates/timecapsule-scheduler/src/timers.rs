//! Task Scheduler — one-shot, cancellable timers keyed by capsule id.
//!
//! Registration lifecycle: `Unregistered → Armed → {Fired, Canceled} → Unregistered`.
//! Arming an id that is already armed cancels the old timer first, so there is
//! never more than one live timer per capsule. The registry lives in memory
//! only; a restart loses it (see `CapsuleService::restore` and the sweep).
//!
//! Each armed timer is a tokio task sleeping until its deadline. Canceling
//! drops the registration's cancel sender, which wakes the task and ends it.
//! A fired timer removes its own registration (generation-checked, under the
//! registry lock) before processing, so a `cancel` that returns `true` always
//! beats the fire. Once processing has started it is never interrupted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use timecapsule_core::ProcessOutcome;
use timecapsule_core::error::Result;
use tokio::sync::oneshot;

use crate::processor::DeliveryProcessor;

/// Longest single sleep. Far-future deadlines are reached in steps, re-reading
/// the wall clock each time.
const MAX_SLEEP: Duration = Duration::from_secs(6 * 60 * 60);

/// Handle to one delivery attempt (timer-driven or immediate).
pub struct DeliveryTicket {
    capsule_id: String,
    rx: oneshot::Receiver<Result<ProcessOutcome>>,
}

impl DeliveryTicket {
    pub fn capsule_id(&self) -> &str {
        &self.capsule_id
    }

    /// Wait for the attempt. `None` if the timer was canceled, replaced, or
    /// the scheduler shut down before it fired.
    pub async fn outcome(self) -> Option<Result<ProcessOutcome>> {
        self.rx.await.ok()
    }
}

struct Registration {
    generation: u64,
    fire_at: DateTime<Utc>,
    // Dropping this sender cancels the timer task.
    _cancel: oneshot::Sender<()>,
}

#[derive(Default)]
struct Registry {
    timers: HashMap<String, Registration>,
    next_generation: u64,
    closed: bool,
}

struct Inner {
    processor: Arc<DeliveryProcessor>,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove the registration for `id` if it still belongs to `generation`.
    fn take_if_current(&self, id: &str, generation: u64) -> bool {
        let mut registry = self.registry();
        match registry.timers.get(id) {
            Some(reg) if reg.generation == generation => {
                registry.timers.remove(id);
                true
            }
            _ => false,
        }
    }
}

/// In-process timer registry. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(processor: Arc<DeliveryProcessor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                processor,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn processor(&self) -> &Arc<DeliveryProcessor> {
        &self.inner.processor
    }

    /// Arm (or re-arm) the timer for `id`.
    ///
    /// A `fire_at` that is not in the future triggers the delivery attempt
    /// right away; it has completed by the time this returns.
    pub async fn arm(&self, id: &str, fire_at: DateTime<Utc>) -> DeliveryTicket {
        let (result_tx, rx) = oneshot::channel();
        let ticket = DeliveryTicket {
            capsule_id: id.to_string(),
            rx,
        };

        {
            let mut registry = self.inner.registry();
            if registry.closed {
                tracing::warn!("⚠️ Scheduler is shut down, not arming capsule {id}");
                return ticket;
            }
            if let Some(previous) = registry.timers.remove(id) {
                tracing::debug!(
                    "🔁 Replacing timer for capsule {} (was {})",
                    id,
                    previous.fire_at
                );
            }

            if fire_at > Utc::now() {
                registry.next_generation += 1;
                let generation = registry.next_generation;
                let (cancel_tx, cancel_rx) = oneshot::channel();
                registry.timers.insert(
                    id.to_string(),
                    Registration {
                        generation,
                        fire_at,
                        _cancel: cancel_tx,
                    },
                );
                tokio::spawn(run_timer(
                    Arc::clone(&self.inner),
                    id.to_string(),
                    generation,
                    fire_at,
                    cancel_rx,
                    result_tx,
                ));
                tracing::info!("⏰ Capsule {} armed for {}", id, fire_at);
                return ticket;
            }
        }

        tracing::info!("⚡ Capsule {} is due ({}), delivering now", id, fire_at);
        let result = self.inner.processor.process(id).await;
        log_result(id, &result);
        let _ = result_tx.send(result);
        ticket
    }

    /// Drop the timer for `id` without firing. Returns whether one was armed.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.inner.registry().timers.remove(id).is_some();
        if removed {
            tracing::info!("🛑 Timer canceled for capsule {id}");
        }
        removed
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.inner.registry().timers.contains_key(id)
    }

    /// Deadline of the armed timer for `id`.
    pub fn fire_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.inner.registry().timers.get(id).map(|r| r.fire_at)
    }

    pub fn armed_count(&self) -> usize {
        self.inner.registry().timers.len()
    }

    /// Cancel every timer and refuse further arming. Returns how many were canceled.
    pub fn shutdown(&self) -> usize {
        let mut registry = self.inner.registry();
        registry.closed = true;
        let canceled = registry.timers.len();
        registry.timers.clear();
        tracing::info!("⏹️ Scheduler shut down ({canceled} timer(s) canceled)");
        canceled
    }
}

async fn run_timer(
    inner: Arc<Inner>,
    id: String,
    generation: u64,
    fire_at: DateTime<Utc>,
    mut cancel_rx: oneshot::Receiver<()>,
    result_tx: oneshot::Sender<Result<ProcessOutcome>>,
) {
    loop {
        let Ok(remaining) = (fire_at - Utc::now()).to_std() else {
            break;
        };
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(remaining.min(MAX_SLEEP)) => {}
            _ = &mut cancel_rx => {
                tracing::debug!("Timer task for capsule {id} (gen {generation}) stopped");
                return;
            }
        }
    }

    if !inner.take_if_current(&id, generation) {
        return;
    }

    tracing::info!("🔔 Timer fired for capsule {id}");
    let result = inner.processor.process(&id).await;
    log_result(&id, &result);
    let _ = result_tx.send(result);
}

fn log_result(id: &str, result: &Result<ProcessOutcome>) {
    match result {
        Ok(ProcessOutcome::Sent) => {}
        Ok(ProcessOutcome::AlreadyResolved(status)) => {
            tracing::debug!("Capsule {id} needed no delivery ({status})");
        }
        Ok(ProcessOutcome::NotDue) => {
            tracing::debug!("Capsule {id} fired early or was rescheduled, skipped");
        }
        Err(e) => tracing::warn!("⚠️ Delivery attempt for capsule {id} failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{RecordingGateway, capsule_at};
    use chrono::Duration as ChronoDuration;
    use timecapsule_core::{CapsuleStatus, CapsuleStore};

    async fn setup() -> (Arc<MemoryStore>, Arc<RecordingGateway>, TaskScheduler) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::new());
        let processor = Arc::new(DeliveryProcessor::new(store.clone(), gateway.clone()));
        (store, gateway, TaskScheduler::new(processor))
    }

    #[tokio::test]
    async fn test_arm_past_delivers_immediately() {
        let (store, gateway, scheduler) = setup().await;
        let past = Utc::now() - ChronoDuration::minutes(5);
        store.create(capsule_at("c1", past)).await.unwrap();

        let ticket = scheduler.arm("c1", past).await;
        // Already delivered before any waiting.
        assert_eq!(gateway.sent_count(), 1);
        assert!(!scheduler.is_armed("c1"));
        assert_eq!(ticket.capsule_id(), "c1");
        assert!(matches!(ticket.outcome().await, Some(Ok(ProcessOutcome::Sent))));
    }

    #[tokio::test]
    async fn test_rearm_replaces_registration() {
        let (store, gateway, scheduler) = setup().await;
        let first = Utc::now() + ChronoDuration::milliseconds(200);
        let second = Utc::now() + ChronoDuration::hours(1);
        store.create(capsule_at("c1", first)).await.unwrap();

        let old_ticket = scheduler.arm("c1", first).await;
        let _new_ticket = scheduler.arm("c1", second).await;

        assert_eq!(scheduler.armed_count(), 1);
        assert_eq!(scheduler.fire_at("c1"), Some(second));
        // The replaced timer never fires.
        assert!(old_ticket.outcome().await.is_none());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(gateway.attempts(), 0);
        assert!(scheduler.is_armed("c1"));
    }

    #[tokio::test]
    async fn test_cancel_prevents_delivery() {
        let (store, gateway, scheduler) = setup().await;
        let at = Utc::now() + ChronoDuration::milliseconds(100);
        store.create(capsule_at("c1", at)).await.unwrap();

        let ticket = scheduler.arm("c1", at).await;
        assert!(scheduler.cancel("c1"));
        assert!(!scheduler.cancel("c1"));
        assert!(!scheduler.cancel("never-armed"));

        assert!(ticket.outcome().await.is_none());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gateway.attempts(), 0);
        let c = store.find_by_id("c1").await.unwrap().unwrap();
        assert_eq!(c.status, CapsuleStatus::Pending);
    }

    #[tokio::test]
    async fn test_fire_delivers_and_unregisters() {
        let (store, gateway, scheduler) = setup().await;
        let at = Utc::now() + ChronoDuration::milliseconds(150);
        store.create(capsule_at("c1", at)).await.unwrap();

        let ticket = scheduler.arm("c1", at).await;
        assert!(scheduler.is_armed("c1"));

        let outcome = tokio::time::timeout(Duration::from_secs(5), ticket.outcome())
            .await
            .unwrap();
        assert!(matches!(outcome, Some(Ok(ProcessOutcome::Sent))));
        assert!(Utc::now() >= at);
        assert!(!scheduler.is_armed("c1"));
        assert_eq!(gateway.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_fire_for_deleted_capsule_reports_not_found() {
        let (_store, gateway, scheduler) = setup().await;
        let ticket = scheduler
            .arm("ghost", Utc::now() + ChronoDuration::milliseconds(50))
            .await;

        let outcome = ticket.outcome().await.unwrap();
        assert_eq!(outcome.unwrap_err().kind(), "not_found");
        assert_eq!(gateway.attempts(), 0);
    }

    #[tokio::test]
    async fn test_independent_capsules() {
        let (store, gateway, scheduler) = setup().await;
        let soon = Utc::now() + ChronoDuration::milliseconds(100);
        let later = Utc::now() + ChronoDuration::hours(2);
        store.create(capsule_at("soon", soon)).await.unwrap();
        store.create(capsule_at("later", later)).await.unwrap();

        let ticket = scheduler.arm("soon", soon).await;
        scheduler.arm("later", later).await;
        assert_eq!(scheduler.armed_count(), 2);

        ticket.outcome().await.unwrap().unwrap();
        assert_eq!(gateway.sent_to(), vec!["soon@example.com".to_string()]);
        assert_eq!(scheduler.armed_count(), 1);
        assert!(scheduler.is_armed("later"));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let (store, gateway, scheduler) = setup().await;
        let at = Utc::now() + ChronoDuration::milliseconds(100);
        store.create(capsule_at("a", at)).await.unwrap();
        store.create(capsule_at("b", at)).await.unwrap();

        let ta = scheduler.arm("a", at).await;
        let tb = scheduler.arm("b", at).await;
        assert_eq!(scheduler.shutdown(), 2);
        assert_eq!(scheduler.armed_count(), 0);
        assert!(ta.outcome().await.is_none());
        assert!(tb.outcome().await.is_none());

        let refused = scheduler.arm("a", Utc::now() - ChronoDuration::seconds(1)).await;
        assert!(refused.outcome().await.is_none());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(gateway.attempts(), 0);
    }

    #[tokio::test]
    async fn test_separate_schedulers_do_not_interfere() {
        let (store, _gateway, one) = setup().await;
        let gateway = Arc::new(RecordingGateway::new());
        let two = TaskScheduler::new(Arc::new(DeliveryProcessor::new(store.clone(), gateway)));

        let at = Utc::now() + ChronoDuration::hours(1);
        one.arm("c1", at).await;
        assert!(one.is_armed("c1"));
        assert!(!two.is_armed("c1"));
        assert!(!two.cancel("c1"));
        assert!(one.is_armed("c1"));
    }
}
