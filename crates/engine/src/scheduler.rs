//! The job state machine and the worker pool that drives it.
//!
//! ```text
//!              enqueue_job
//!                  |
//!                  v
//!              [queued] <---------------------------+
//!                  |  claim_next_job                |
//!                  v                                 | requeue (backoff,
//!              [running] ---- awaiting_auth -------> [awaiting_auth]
//!                  |   \                                  |
//!                  |    \-- cancel ---> [cancelled]        | resolve_auth
//!                  |    \-- terminal error -> [failed]     |
//!                  +------------------------------------<--+
//!                  |
//!                  v
//!              [completed]
//! ```
//!
//! Workers are plain tokio tasks, shut down cooperatively through a shared
//! `is_running` flag and a `Notify`, the same pattern the donor's agent
//! scheduler uses for its background loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::Notify;

use crate::store::Store;
use crate::types::{ErrorKind, Job, JobId, JobKind, SchedulerError, TaskId};

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobOutcome;
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed,
    AwaitingAuth,
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopScope {
    AllJobs,
    TargetQueueOnly,
}

const MAX_ATTEMPTS: u32 = 6;
const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 60_000;

pub struct Scheduler {
    store: Arc<dyn Store>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    num_workers: usize,
    is_running: Arc<RwLock<bool>>,
    shutdown_notify: Arc<Notify>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, handlers: HashMap<JobKind, Arc<dyn JobHandler>>, num_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            handlers,
            num_workers,
            is_running: Arc::new(RwLock::new(true)),
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    /// Spawns `num_workers` worker loops. Returns their join handles so the
    /// caller can await a clean shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let acceptable_kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        (0..self.num_workers)
            .map(|i| {
                let scheduler = self.clone();
                let kinds = acceptable_kinds.clone();
                let worker_id = format!("worker-{i}");
                tokio::spawn(async move { scheduler.worker_loop(worker_id, kinds).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String, acceptable_kinds: Vec<JobKind>) {
        let mut idle_poll = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = idle_poll.tick() => {
                    if !*self.is_running.read() {
                        break;
                    }
                    if let Err(e) = self.run_one(&worker_id, &acceptable_kinds).await {
                        tracing::warn!(worker = %worker_id, error = %e, "worker iteration failed");
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    break;
                }
            }
        }
        tracing::info!(worker = %worker_id, "worker stopped");
    }

    async fn run_one(&self, worker_id: &str, acceptable_kinds: &[JobKind]) -> Result<(), SchedulerError> {
        let Some(job) = self
            .store
            .claim_next_job(worker_id, acceptable_kinds)
            .await
            .map_err(|_| SchedulerError::ShuttingDown)?
        else {
            return Ok(());
        };

        let Some(handler) = self.handlers.get(&job.kind) else {
            tracing::error!(job_id = %job.job_id, kind = ?job.kind, "no handler registered for job kind");
            self.store
                .fail_job(job.job_id, "no handler registered for job kind", true)
                .await
                .map_err(|_| SchedulerError::JobNotFound { job_id: job.job_id })?;
            return Ok(());
        };

        let outcome = handler.handle(&job).await;
        self.apply_outcome(&job, outcome).await
    }

    async fn apply_outcome(&self, job: &Job, outcome: JobOutcome) -> Result<(), SchedulerError> {
        match outcome {
            JobOutcome::Completed => {
                self.store
                    .complete_job(job.job_id)
                    .await
                    .map_err(|_| SchedulerError::JobNotFound { job_id: job.job_id })?;
            }
            JobOutcome::AwaitingAuth => {
                self.store
                    .park_job_awaiting_auth(job.job_id)
                    .await
                    .map_err(|_| SchedulerError::JobNotFound { job_id: job.job_id })?;
            }
            JobOutcome::Failed { kind, message } => {
                let retriable = kind.is_retriable() && job.attempts + 1 < MAX_ATTEMPTS;
                if retriable {
                    tokio::time::sleep(Self::retry_delay(job.attempts)).await;
                }
                self.store
                    .fail_job(job.job_id, &message, !retriable)
                    .await
                    .map_err(|_| SchedulerError::JobNotFound { job_id: job.job_id })?;
            }
        }
        Ok(())
    }

    /// Exponential backoff with full jitter: `rand(0, min(max, base * 2^attempts))`.
    fn retry_delay(attempts: u32) -> Duration {
        let exp = BASE_BACKOFF_MS.saturating_mul(1u64 << attempts.min(10));
        let cap = exp.min(MAX_BACKOFF_MS);
        let jittered = rand::thread_rng().gen_range(0..=cap.max(1));
        Duration::from_millis(jittered)
    }

    /// Cancels non-terminal jobs for a task. `TargetQueueOnly` leaves
    /// `verify_nli`/`citation_graph` jobs running so in-flight evidence work
    /// finishes; `AllJobs` cancels everything.
    pub async fn stop_task(&self, task_id: TaskId, scope: StopScope) -> Result<u32, SchedulerError> {
        let kinds_excluded: &[JobKind] = match scope {
            StopScope::AllJobs => &[],
            StopScope::TargetQueueOnly => &[JobKind::VerifyNli, JobKind::CitationGraph],
        };
        self.store
            .cancel_non_terminal_jobs(task_id, kinds_excluded)
            .await
            .map_err(|_| SchedulerError::JobNotFound { job_id: JobId::new() })
    }

    pub fn shutdown(&self) {
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{Priority, Task, TaskBudget, TaskStatus};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        outcome: JobOutcome,
    }

    #[async_trait::async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> JobOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    async fn seed_task(store: &SqliteStore) -> TaskId {
        let task = Task {
            task_id: TaskId::new(),
            hypothesis: "x".into(),
            status: TaskStatus::Exploring,
            created_at: Utc::now(),
            budget: TaskBudget::default(),
        };
        store.create_task(&task).await.unwrap();
        task.task_id
    }

    #[tokio::test]
    async fn completed_job_transitions_to_completed() {
        let sqlite = SqliteStore::open_in_memory().unwrap();
        let task_id = seed_task(&sqlite).await;
        let store: Arc<dyn Store> = Arc::new(sqlite);

        let job = Job {
            job_id: JobId::new(),
            task_id,
            kind: JobKind::Search,
            payload: serde_json::json!({}),
            payload_hash: "h".into(),
            priority: Priority::Normal,
            state: crate::types::JobState::Queued,
            attempts: 0,
            created_at: Utc::now(),
            claim_token: None,
            last_error: None,
        };
        store.enqueue_job(&job).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers: HashMap<JobKind, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(
            JobKind::Search,
            Arc::new(CountingHandler { calls: calls.clone(), outcome: JobOutcome::Completed }),
        );
        let scheduler = Scheduler::new(store.clone(), handlers, 1);
        scheduler.run_one("worker-0", &[JobKind::Search]).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let reloaded = store.load_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, crate::types::JobState::Completed);
    }

    #[tokio::test]
    async fn stop_task_all_jobs_cancels_everything() {
        let sqlite = SqliteStore::open_in_memory().unwrap();
        let task_id = seed_task(&sqlite).await;
        let store: Arc<dyn Store> = Arc::new(sqlite);

        let job = Job {
            job_id: JobId::new(),
            task_id,
            kind: JobKind::Search,
            payload: serde_json::json!({}),
            payload_hash: "h".into(),
            priority: Priority::Normal,
            state: crate::types::JobState::Queued,
            attempts: 0,
            created_at: Utc::now(),
            claim_token: None,
            last_error: None,
        };
        store.enqueue_job(&job).await.unwrap();

        let scheduler = Scheduler::new(store.clone(), HashMap::new(), 1);
        let cancelled = scheduler.stop_task(task_id, StopScope::AllJobs).await.unwrap();
        assert_eq!(cancelled, 1);
    }
}
