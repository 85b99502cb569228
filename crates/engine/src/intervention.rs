//! The human-in-the-loop queue for CAPTCHA/login/Cloudflare walls the
//! automated fetchers cannot clear on their own.
//!
//! Unlike the donor's `HumanCritic`, which suspends an in-process reasoning
//! loop on a channel and a `oneshot` reply, an intervention here must
//! survive a process restart: the job that hit the wall is parked in the
//! store (`awaiting_auth`), and a human can resolve it in a later process.
//! The queue is therefore store-backed rather than channel-backed, with the
//! same "suspend, wait for a human, resume" shape.

use std::sync::Arc;

use crate::store::Store;
use crate::traits::{Fetcher, SessionData};
use crate::types::{AuthType, Intervention, InterventionError, InterventionId, InterventionStatus, JobId, TaskId};

pub struct InterventionQueue {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
}

impl InterventionQueue {
    pub fn new(store: Arc<dyn Store>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { store, fetcher }
    }

    pub async fn enqueue(
        &self,
        task_id: TaskId,
        url: String,
        domain: String,
        auth_type: AuthType,
        search_job_id: Option<JobId>,
    ) -> Result<InterventionId, InterventionError> {
        let intervention = Intervention {
            queue_id: InterventionId::new(),
            task_id,
            url,
            domain,
            auth_type,
            status: InterventionStatus::Pending,
            search_job_id,
            session_data: None,
        };
        self.store
            .intervention_enqueue(&intervention)
            .await
            .map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))?;
        Ok(intervention.queue_id)
    }

    pub async fn list_pending(&self, task_id: Option<TaskId>) -> Result<Vec<Intervention>, InterventionError> {
        self.store
            .intervention_list_pending(task_id)
            .await
            .map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))
    }

    /// Marks the given items `in_progress`, signalling that a human has
    /// opened a headful session for them. Does not itself drive a browser;
    /// that belongs to whatever UI surface calls this queue.
    pub async fn start_session(&self, queue_ids: &[InterventionId]) -> Result<(), InterventionError> {
        for queue_id in queue_ids {
            self.store
                .intervention_mark_in_progress(*queue_id)
                .await
                .map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Completes an intervention: captures the authenticated session for
    /// the domain (cookies, conditional-request headers), marks the queue
    /// item completed, and requeues every job parked `awaiting_auth` for
    /// that domain.
    pub async fn complete(&self, queue_id: InterventionId, domain: &str) -> Result<u32, InterventionError> {
        let session = self
            .fetcher
            .capture_session(domain)
            .await
            .map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))?;

        let session_value = serde_json::to_value(&session).map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))?;

        self.store
            .intervention_resolve(queue_id, Some(session_value))
            .await
            .map_err(|e| match e {
                crate::types::StoreError::InterventionNotFound { queue_id } => InterventionError::NotFound { queue_id },
                other => InterventionError::SessionCaptureFailed(other.to_string()),
            })?;

        self.resolve_auth(domain).await
    }

    /// Resolves a specific queue item by id. When `session_data` is given
    /// directly (e.g. cookies an operator exported from a headful browser),
    /// it is stored as-is; otherwise falls back to `fetcher.capture_session`
    /// the way [`complete`] does.
    pub async fn resolve_by_id(&self, queue_id: InterventionId, session_data: Option<serde_json::Value>) -> Result<u32, InterventionError> {
        let intervention = self
            .store
            .intervention_get(queue_id)
            .await
            .map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))?
            .ok_or(InterventionError::NotFound { queue_id })?;

        let session_value = match session_data {
            Some(v) => v,
            None => {
                let session = self
                    .fetcher
                    .capture_session(&intervention.domain)
                    .await
                    .map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))?;
                serde_json::to_value(&session).map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))?
            }
        };

        self.store
            .intervention_resolve(queue_id, Some(session_value))
            .await
            .map_err(|e| match e {
                crate::types::StoreError::InterventionNotFound { queue_id } => InterventionError::NotFound { queue_id },
                other => InterventionError::SessionCaptureFailed(other.to_string()),
            })?;

        self.resolve_auth(&intervention.domain).await
    }

    /// Requeues every job parked `awaiting_auth` for a domain, without
    /// going through a specific intervention (used when a session is
    /// captured out of band, e.g. a login cookie imported by an operator).
    pub async fn resolve_auth(&self, domain: &str) -> Result<u32, InterventionError> {
        self.store
            .requeue_jobs_for_domain(domain)
            .await
            .map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))
    }

    /// The session captured for a domain by its most recently completed
    /// intervention, if any. Injected into outgoing requests for matching
    /// domains so a resolved CAPTCHA is not immediately re-triggered.
    pub async fn session_for_domain(&self, domain: &str) -> Result<Option<SessionData>, InterventionError> {
        let raw = self
            .store
            .intervention_get_session_for_domain(domain)
            .await
            .map_err(|e| InterventionError::SessionCaptureFailed(e.to_string()))?;
        raw.map(|v| serde_json::from_value(v).map_err(|e| InterventionError::SessionCaptureFailed(e.to_string())))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::traits::mocks::MockFetcher;
    use crate::types::{Task, TaskBudget, TaskStatus};
    use chrono::Utc;

    async fn seeded() -> (Arc<dyn Store>, TaskId) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let task = Task {
            task_id: TaskId::new(),
            hypothesis: "x".into(),
            status: TaskStatus::Exploring,
            created_at: Utc::now(),
            budget: TaskBudget::default(),
        };
        store.create_task(&task).await.unwrap();
        (store, task.task_id)
    }

    #[tokio::test]
    async fn enqueue_then_complete_requeues_parked_jobs() {
        let (store, task_id) = seeded().await;
        let fetcher = Arc::new(MockFetcher::default());
        let queue = InterventionQueue::new(store.clone(), fetcher);

        let queue_id = queue
            .enqueue(task_id, "https://paywalled.example/a".into(), "paywalled.example".into(), AuthType::Login, None)
            .await
            .unwrap();

        let pending = queue.list_pending(Some(task_id)).await.unwrap();
        assert_eq!(pending.len(), 1);

        queue.start_session(&[queue_id]).await.unwrap();
        let requeued = queue.complete(queue_id, "paywalled.example").await.unwrap();
        assert_eq!(requeued, 0);

        let pending_after = queue.list_pending(Some(task_id)).await.unwrap();
        assert!(pending_after.is_empty());
    }

    #[tokio::test]
    async fn session_for_domain_is_none_before_any_completion() {
        let (store, _task_id) = seeded().await;
        let fetcher = Arc::new(MockFetcher::default());
        let queue = InterventionQueue::new(store, fetcher);
        assert!(queue.session_for_domain("unseen.example").await.unwrap().is_none());
    }
}
