//! Resource gating shared by every job: a global cap on calls to paid
//! academic APIs, a global cap on open browser tabs, and a per-engine cap
//! that backs off automatically under sustained failure and recovers once
//! an engine has been stable for a while (ADR-0015).
//!
//! Each pool is a `tokio::sync::Semaphore`; `available_permits()` plays the
//! role the donor's `ResourcePool::available_*` counters play, but backed
//! by the primitive async code actually uses to gate concurrent admission
//! rather than a hand-rolled counter a caller could forget to decrement.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{BackoffConfig, ConcurrencyConfig};
use crate::types::{ConcurrencyError, TaskId};

struct EngineSlot {
    semaphore: Arc<Semaphore>,
    ceiling: AtomicU32,
    current: AtomicU32,
    consecutive_successes: AtomicU32,
    last_backoff_at: AtomicI64,
}

impl EngineSlot {
    fn new(concurrency: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            ceiling: AtomicU32::new(concurrency),
            current: AtomicU32::new(concurrency),
            consecutive_successes: AtomicU32::new(0),
            last_backoff_at: AtomicI64::new(0),
        }
    }
}

pub struct ConcurrencyController {
    academic_api: Arc<Semaphore>,
    browser_tabs: Arc<Semaphore>,
    per_engine: DashMap<String, Arc<EngineSlot>>,
    backoff: BackoffConfig,
    default_engine_concurrency: u32,
    cancelled_tasks: DashMap<TaskId, ()>,
}

impl ConcurrencyController {
    pub fn new(config: &ConcurrencyConfig) -> Self {
        Self {
            academic_api: Arc::new(Semaphore::new(1)),
            browser_tabs: Arc::new(Semaphore::new(config.max_tabs as usize)),
            per_engine: DashMap::new(),
            backoff: config.backoff.clone(),
            default_engine_concurrency: config.num_workers.max(1),
            cancelled_tasks: DashMap::new(),
        }
    }

    pub async fn acquire_academic_api(&self) -> Result<OwnedSemaphorePermit, ConcurrencyError> {
        self.academic_api
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConcurrencyError::PoolExhausted("academic_api".into()))
    }

    pub async fn acquire_browser_tab(&self) -> Result<OwnedSemaphorePermit, ConcurrencyError> {
        self.browser_tabs
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConcurrencyError::PoolExhausted("browser_tabs".into()))
    }

    pub async fn acquire_engine_slot(&self, engine: &str) -> Result<OwnedSemaphorePermit, ConcurrencyError> {
        let slot = self
            .per_engine
            .entry(engine.to_string())
            .or_insert_with(|| Arc::new(EngineSlot::new(self.default_engine_concurrency)))
            .clone();
        slot.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConcurrencyError::PoolExhausted(engine.to_string()))
    }

    pub async fn acquire_engine_slot_timeout(&self, engine: &str, timeout: Duration) -> Result<OwnedSemaphorePermit, ConcurrencyError> {
        tokio::time::timeout(timeout, self.acquire_engine_slot(engine))
            .await
            .map_err(|_| ConcurrencyError::AcquireTimeout(timeout))?
    }

    /// Shrinks an engine's concurrency ceiling by `decrease_step`, never
    /// below 1. Permits already issued are unaffected; the reduced ceiling
    /// only throttles future acquisitions by forgetting permits.
    pub fn backoff_engine(&self, engine: &str) {
        let slot = self
            .per_engine
            .entry(engine.to_string())
            .or_insert_with(|| Arc::new(EngineSlot::new(self.default_engine_concurrency)))
            .clone();

        let current = slot.current.load(Ordering::SeqCst);
        let reduced = current.saturating_sub(self.backoff.decrease_step).max(1);
        let to_forget = current.saturating_sub(reduced);
        for _ in 0..to_forget {
            if let Ok(permit) = slot.semaphore.clone().try_acquire_owned() {
                permit.forget();
            } else {
                break;
            }
        }
        slot.current.store(reduced, Ordering::SeqCst);
        slot.consecutive_successes.store(0, Ordering::SeqCst);
        slot.last_backoff_at.store(now_unix(), Ordering::SeqCst);
        tracing::warn!(engine, ceiling = reduced, "engine concurrency backed off");
    }

    /// Call after every successful job on `engine`. Once the engine has
    /// been stable (no backoff) for `recovery_stable`, restores one permit
    /// toward the original ceiling.
    pub fn record_engine_success(&self, engine: &str) {
        let Some(slot) = self.per_engine.get(engine) else { return };
        let slot = slot.clone();
        let current = slot.current.load(Ordering::SeqCst);
        let ceiling = slot.ceiling.load(Ordering::SeqCst);
        if current >= ceiling {
            return;
        }
        let last_backoff = slot.last_backoff_at.load(Ordering::SeqCst);
        let stable_for = now_unix() - last_backoff;
        if stable_for < self.backoff.recovery_stable.as_secs() as i64 {
            return;
        }
        slot.semaphore.add_permits(1);
        slot.current.store(current + 1, Ordering::SeqCst);
        slot.last_backoff_at.store(now_unix(), Ordering::SeqCst);
        tracing::info!(engine, ceiling = current + 1, "engine concurrency recovered one slot");
    }

    pub fn cancel_task(&self, task_id: TaskId) {
        self.cancelled_tasks.insert(task_id, ());
    }

    pub fn uncancel_task(&self, task_id: TaskId) {
        self.cancelled_tasks.remove(&task_id);
    }

    pub fn check_cancelled(&self, task_id: TaskId) -> Result<(), ConcurrencyError> {
        if self.cancelled_tasks.contains_key(&task_id) {
            Err(ConcurrencyError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn available_academic_api_permits(&self) -> usize {
        self.academic_api.available_permits()
    }

    pub fn available_browser_tabs(&self) -> usize {
        self.browser_tabs.available_permits()
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ConcurrencyConfig {
        ConcurrencyConfig {
            num_workers: 4,
            max_tabs: 2,
            backoff: BackoffConfig {
                decrease_step: 1,
                recovery_stable: Duration::from_secs(0),
            },
        }
    }

    #[tokio::test]
    async fn browser_tabs_are_capped() {
        let controller = ConcurrencyController::new(&cfg());
        let _a = controller.acquire_browser_tab().await.unwrap();
        let _b = controller.acquire_browser_tab().await.unwrap();
        assert_eq!(controller.available_browser_tabs(), 0);
    }

    #[tokio::test]
    async fn backoff_reduces_engine_ceiling() {
        let controller = ConcurrencyController::new(&cfg());
        let _permit = controller.acquire_engine_slot("arxiv").await.unwrap();
        controller.backoff_engine("arxiv");
        let slot = controller.per_engine.get("arxiv").unwrap();
        assert_eq!(slot.current.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovery_restores_a_slot_after_stable_period() {
        let controller = ConcurrencyController::new(&cfg());
        controller.backoff_engine("arxiv");
        controller.record_engine_success("arxiv");
        let slot = controller.per_engine.get("arxiv").unwrap();
        assert_eq!(slot.current.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_task_is_reported() {
        let controller = ConcurrencyController::new(&cfg());
        let task_id = TaskId::new();
        assert!(controller.check_cancelled(task_id).is_ok());
        controller.cancel_task(task_id);
        assert!(controller.check_cancelled(task_id).is_err());
    }
}
