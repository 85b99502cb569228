//! The external interface: eight operations a caller drives a task through,
//! from `create_task` to `stop_task`. Every response here is a purpose-built
//! struct carrying only the fields a caller is allowed to see — whitelisting
//! is enforced by construction (the struct has no other fields to leak),
//! rather than by a runtime field-stripping pass over a generic JSON value.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::evidence::EvidenceGraph;
use crate::feedback::FeedbackBus;
use crate::intervention::InterventionQueue;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::retriever::SearchStatus;
use crate::scheduler::{Scheduler, StopScope};
use crate::store::{SearchRecord, Store};
use crate::types::{
    AuthType, ClaimId, DomainCategory, EdgeRelation, InterventionId, Job, JobKind, JobState,
    Priority, ProtocolError, Target, Task, TaskBudget, TaskId, TaskStatus,
};

pub struct Protocol {
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    evidence: EvidenceGraph,
    feedback: FeedbackBus,
    interventions: InterventionQueue,
    metrics: Arc<MetricsRegistry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: TaskId,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueTargetsResponse {
    pub job_ids: Vec<String>,
    pub duplicates_skipped: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchStatusView {
    pub id: String,
    pub query: String,
    pub status: SearchStatus,
    pub pages_fetched: u32,
    pub useful_fragments: u32,
    pub harvest_rate: f64,
    pub satisfaction_score: f64,
    pub has_primary_source: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetView {
    pub pages_limit: u32,
    pub time_limit_s: u64,
    pub pages_used: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthQueueSummary {
    pub pending_count: u32,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: TaskStatus,
    pub searches: Vec<SearchStatusView>,
    pub metrics: MetricsSnapshot,
    pub budget: BudgetView,
    pub auth_queue: AuthQueueSummary,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceView {
    pub url: String,
    pub title: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimView {
    pub id: ClaimId,
    pub text: String,
    pub confidence: f64,
    pub uncertainty: f64,
    pub controversy: f64,
    pub evidence_count: u32,
    pub has_refutation: bool,
    pub sources: Vec<SourceView>,
    pub evidence_years: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentView {
    pub id: String,
    pub text: String,
    pub source_url: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub node_type: &'static str,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub relation: EdgeRelation,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvidenceGraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterialsResponse {
    pub claims: Vec<ClaimView>,
    pub fragments: Vec<FragmentView>,
    pub evidence_graph: Option<EvidenceGraphView>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackResponse {
    pub accepted: bool,
    pub affected_claims: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthQueueItem {
    pub queue_id: InterventionId,
    pub url: String,
    pub domain: String,
    pub auth_type: AuthType,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveAuthResponse {
    pub requeued_jobs: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopTaskResponse {
    pub cancelled_jobs: u32,
}

impl Protocol {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<Scheduler>, interventions: InterventionQueue, metrics: Arc<MetricsRegistry>) -> Self {
        let evidence = EvidenceGraph::new(store.clone());
        let feedback = FeedbackBus::new(store.clone());
        Self { store, scheduler, evidence, feedback, interventions, metrics }
    }

    pub async fn create_task(&self, hypothesis: String, budget: Option<TaskBudget>) -> Result<CreateTaskResponse, ProtocolError> {
        if hypothesis.trim().is_empty() {
            return Err(ProtocolError::Validation("hypothesis must not be empty".into()));
        }
        let task = Task {
            task_id: TaskId::new(),
            hypothesis,
            status: TaskStatus::Exploring,
            created_at: chrono::Utc::now(),
            budget: budget.unwrap_or_default(),
        };
        self.store.create_task(&task).await.map_err(|e| ProtocolError::Validation(e.to_string()))?;
        Ok(CreateTaskResponse { task_id: task.task_id, status: "exploring" })
    }

    pub async fn queue_targets(&self, task_id: TaskId, targets: Vec<Target>) -> Result<QueueTargetsResponse, ProtocolError> {
        let mut job_ids = Vec::new();
        let mut duplicates_skipped = 0u32;

        for target in targets {
            let (kind, payload) = match &target {
                Target::Query { text } => (JobKind::Search, serde_json::json!({ "query": text })),
                Target::Doi { value } => (JobKind::IngestDoi, serde_json::json!({ "doi": value })),
                Target::Url { value } => (JobKind::IngestUrl, serde_json::json!({ "url": value })),
            };
            let job = Job {
                job_id: crate::types::JobId::new(),
                task_id,
                kind,
                payload_hash: crate::store::payload_hash(&payload),
                payload,
                priority: Priority::Normal,
                state: JobState::Queued,
                attempts: 0,
                created_at: chrono::Utc::now(),
                claim_token: None,
                last_error: None,
            };
            match self.store.enqueue_job(&job).await.map_err(|e| ProtocolError::Validation(e.to_string()))? {
                Some(job_id) => job_ids.push(job_id.to_string()),
                None => duplicates_skipped += 1,
            }
        }

        Ok(QueueTargetsResponse { job_ids, duplicates_skipped })
    }

    /// Polls every 250ms until either every job for the task has left
    /// `queued`/`running`, or `wait_seconds` elapses, whichever comes first.
    /// A `None` `wait_seconds` returns the current status immediately.
    pub async fn get_status(&self, task_id: TaskId, wait_seconds: Option<u64>) -> Result<StatusResponse, ProtocolError> {
        let task = self
            .store
            .load_task(task_id)
            .await
            .map_err(|e| ProtocolError::Validation(e.to_string()))?
            .ok_or_else(|| ProtocolError::Validation(format!("unknown task {task_id}")))?;

        let deadline = wait_seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
        loop {
            let jobs = self.store.list_jobs_for_task(task_id).await.map_err(|e| ProtocolError::Validation(e.to_string()))?;
            let in_flight = jobs.iter().any(|j| matches!(j.state, JobState::Queued | JobState::Running));
            let past_deadline = deadline.map(|d| tokio::time::Instant::now() >= d).unwrap_or(true);
            if !in_flight || past_deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let jobs = self.store.list_jobs_for_task(task_id).await.map_err(|e| ProtocolError::Validation(e.to_string()))?;
        let warnings: Vec<String> = jobs
            .iter()
            .filter(|j| j.state == JobState::Failed)
            .filter_map(|j| j.last_error.clone())
            .collect();

        let records = self.store.list_searches_for_task(task_id).await.map_err(|e| ProtocolError::Validation(e.to_string()))?;
        let pages_used: u32 = records.iter().map(|r| r.pages_fetched).sum();
        let searches = records.into_iter().map(search_view).collect();

        let pending = self.interventions.list_pending(Some(task_id)).await.map_err(|e| ProtocolError::Validation(e.to_string()))?;
        let domains: Vec<String> = pending.iter().map(|i| i.domain.clone()).collect::<HashSet<_>>().into_iter().collect();

        Ok(StatusResponse {
            status: task.status,
            searches,
            metrics: self.metrics.snapshot(pending.len() as u64),
            budget: BudgetView {
                pages_limit: task.budget.pages_limit,
                time_limit_s: task.budget.time_limit_s,
                pages_used,
            },
            auth_queue: AuthQueueSummary { pending_count: pending.len() as u32, domains },
            warnings,
        })
    }

    pub async fn get_materials(&self, task_id: TaskId, include_graph: bool) -> Result<MaterialsResponse, ProtocolError> {
        let graph = self.evidence.load_from_db(task_id).await.map_err(|e| ProtocolError::Validation(e.to_string()))?;

        let mut claims = Vec::new();
        for claim in &graph.claims {
            let edges: Vec<_> = graph.edges.iter().filter(|e| e.target_id == claim.claim_id.0).collect();
            let has_refutation = edges.iter().any(|e| e.relation == EdgeRelation::Refutes);
            let fragments: Vec<_> = edges
                .iter()
                .filter_map(|e| graph.fragments.iter().find(|f| f.fragment_id.0 == e.source_id))
                .collect();
            let mut seen_pages = HashSet::new();
            let mut sources = Vec::new();
            let mut years = HashSet::new();
            for fragment in &fragments {
                let Some(page) = graph.pages.iter().find(|p| p.page_id == fragment.page_id) else { continue };
                if seen_pages.insert(page.page_id) {
                    sources.push(SourceView { url: page.url.clone(), title: page.title.clone(), is_primary: fragment.is_primary });
                }
                if let Some(meta) = &page.paper_metadata {
                    if let Some(year) = meta.year {
                        years.insert(year);
                    }
                }
            }
            let mut evidence_years: Vec<u32> = years.into_iter().collect();
            evidence_years.sort_unstable();

            claims.push(ClaimView {
                id: claim.claim_id,
                text: claim.claim_text.clone(),
                confidence: claim.confidence,
                uncertainty: claim.uncertainty,
                controversy: claim.controversy,
                evidence_count: edges.len() as u32,
                has_refutation,
                sources,
                evidence_years,
            });
        }

        let fragments: Vec<FragmentView> = graph
            .fragments
            .iter()
            .map(|f| FragmentView {
                id: f.fragment_id.to_string(),
                text: f.text.clone(),
                source_url: graph.pages.iter().find(|p| p.page_id == f.page_id).map(|p| p.url.clone()).unwrap_or_default(),
                context: f.heading_context.clone(),
            })
            .collect();

        let evidence_graph = if include_graph {
            let mut nodes = Vec::new();
            for claim in &graph.claims {
                nodes.push(GraphNode { id: claim.claim_id.to_string(), node_type: "claim", label: claim.claim_text.clone() });
            }
            for fragment in &graph.fragments {
                nodes.push(GraphNode { id: fragment.fragment_id.to_string(), node_type: "fragment", label: fragment.relevance_reason.clone() });
            }
            let edges = graph
                .edges
                .iter()
                .map(|e| GraphEdge { source: e.source_id.to_string(), target: e.target_id.to_string(), relation: e.relation })
                .collect();
            Some(EvidenceGraphView { nodes, edges })
        } else {
            None
        };

        let summary = format!("{} claim(s) backed by {} fragment(s) across {} source(s)", claims.len(), fragments.len(), graph.pages.len());

        Ok(MaterialsResponse { claims, fragments, evidence_graph, summary })
    }

    /// Dispatches a correction by `action`: `edge_correct`, `claim_mark`, or
    /// `domain_reclassify`. `target_id` names the edge/claim/domain being
    /// corrected; `payload` carries the action-specific fields.
    pub async fn feedback(&self, action: &str, target_id: &str, payload: serde_json::Value) -> Result<FeedbackResponse, ProtocolError> {
        match action {
            "edge_correct" => {
                let edge_id = target_id.parse().map_err(|_| ProtocolError::Validation(format!("invalid edge id: {target_id}")))?;
                let relation: EdgeRelation = serde_json::from_value(payload["relation"].clone()).map_err(|_| ProtocolError::Validation("missing or invalid `relation`".into()))?;
                let target_claim_id: Option<ClaimId> = payload.get("claim_id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
                let affected = target_claim_id.is_some() as u32;
                self.feedback
                    .edge_correct_and_recompute(edge_id, relation, target_claim_id)
                    .await
                    .map_err(|e| ProtocolError::Validation(e.to_string()))?;
                Ok(FeedbackResponse { accepted: true, affected_claims: affected })
            }
            "claim_mark" => {
                let claim_id: ClaimId = target_id.parse().map_err(|_| ProtocolError::Validation(format!("invalid claim id: {target_id}")))?;
                let note = payload.get("note").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let confidence_override = payload.get("confidence").and_then(|v| v.as_f64());
                self.feedback
                    .claim_mark(claim_id, note, confidence_override)
                    .await
                    .map_err(|e| ProtocolError::Validation(e.to_string()))?;
                Ok(FeedbackResponse { accepted: true, affected_claims: 1 })
            }
            "domain_reclassify" => {
                let task_id: TaskId = payload
                    .get("task_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| ProtocolError::Validation("missing `task_id`".into()))?;
                let category: DomainCategory = serde_json::from_value(payload["category"].clone()).map_err(|_| ProtocolError::Validation("missing or invalid `category`".into()))?;
                let affected = self
                    .feedback
                    .domain_reclassify(task_id, target_id, category)
                    .await
                    .map_err(|e| ProtocolError::Validation(e.to_string()))?;
                Ok(FeedbackResponse { accepted: true, affected_claims: affected })
            }
            other => Err(ProtocolError::UnknownOperation(other.to_string())),
        }
    }

    pub async fn get_auth_queue(&self, task_id: TaskId) -> Result<Vec<AuthQueueItem>, ProtocolError> {
        let pending = self.interventions.list_pending(Some(task_id)).await.map_err(|e| ProtocolError::Validation(e.to_string()))?;
        Ok(pending
            .into_iter()
            .map(|i| AuthQueueItem { queue_id: i.queue_id, url: i.url, domain: i.domain, auth_type: i.auth_type })
            .collect())
    }

    pub async fn resolve_auth(&self, queue_id: InterventionId, session_data: Option<serde_json::Value>) -> Result<ResolveAuthResponse, ProtocolError> {
        let requeued_jobs = self.interventions.resolve_by_id(queue_id, session_data).await.map_err(|e| ProtocolError::Validation(e.to_string()))?;
        Ok(ResolveAuthResponse { requeued_jobs })
    }

    pub async fn stop_task(&self, task_id: TaskId, scope: StopScope) -> Result<StopTaskResponse, ProtocolError> {
        let cancelled_jobs = self.scheduler.stop_task(task_id, scope).await.map_err(|e| ProtocolError::Validation(e.to_string()))?;
        Ok(StopTaskResponse { cancelled_jobs })
    }
}

/// `satisfaction_score` has no defining formula elsewhere: it is derived
/// here as the harvest rate, discounted by half when the search only
/// partially completed (a CAPTCHA wall was hit) and zeroed when nothing
/// was found at all.
fn search_view(record: SearchRecord) -> SearchStatusView {
    let satisfaction_score = match record.status {
        SearchStatus::Satisfied => record.harvest_rate,
        SearchStatus::Partial => record.harvest_rate * 0.5,
        SearchStatus::Exhausted => 0.0,
    };
    SearchStatusView {
        id: record.search_id,
        query: record.query,
        status: record.status,
        pages_fetched: record.pages_fetched,
        useful_fragments: record.useful_fragments,
        harvest_rate: record.harvest_rate,
        satisfaction_score,
        has_primary_source: record.has_primary_source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyController;
    use crate::policy::PolicyEngine;
    use crate::retriever::Retriever;
    use crate::store::SqliteStore;
    use crate::traits::mocks::{MockFetcher, MockMlClient};
    use std::collections::HashMap;

    async fn protocol_with_retriever() -> (Protocol, Arc<dyn Store>, Arc<Retriever>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = crate::config::Config::default();
        let policy = Arc::new(PolicyEngine::new(store.clone(), config.clone()));
        let concurrency = Arc::new(ConcurrencyController::new(&config.concurrency));
        let fetcher = Arc::new(MockFetcher::default());
        let ml = Arc::new(MockMlClient::default());
        let retriever = Arc::new(Retriever::new(store.clone(), policy, concurrency, fetcher, ml, Vec::new(), config));

        let mut handlers: HashMap<JobKind, Arc<dyn crate::scheduler::JobHandler>> = HashMap::new();
        for kind in [JobKind::Search, JobKind::IngestDoi, JobKind::IngestUrl, JobKind::CitationGraph, JobKind::VerifyNli] {
            handlers.insert(kind, retriever.clone());
        }
        let scheduler = Scheduler::new(store.clone(), handlers, 0);
        let interventions = InterventionQueue::new(store.clone(), Arc::new(MockFetcher::default()));
        let metrics = MetricsRegistry::new();
        (Protocol::new(store.clone(), scheduler, interventions, metrics), store, retriever)
    }

    #[tokio::test]
    async fn create_task_rejects_empty_hypothesis() {
        let (protocol, _store, _retriever) = protocol_with_retriever().await;
        assert!(protocol.create_task(String::new(), None).await.is_err());
    }

    #[tokio::test]
    async fn create_then_queue_then_status_reports_exploring() {
        let (protocol, _store, _retriever) = protocol_with_retriever().await;
        let created = protocol.create_task("coffee causes long life".into(), None).await.unwrap();
        assert_eq!(created.status, "exploring");

        let queued = protocol
            .queue_targets(created.task_id, vec![Target::Query { text: "coffee longevity".into() }])
            .await
            .unwrap();
        assert_eq!(queued.job_ids.len(), 1);
        assert_eq!(queued.duplicates_skipped, 0);

        let dup = protocol
            .queue_targets(created.task_id, vec![Target::Query { text: "coffee longevity".into() }])
            .await
            .unwrap();
        assert_eq!(dup.duplicates_skipped, 1);

        let status = protocol.get_status(created.task_id, None).await.unwrap();
        assert_eq!(status.status, TaskStatus::Exploring);
        assert_eq!(status.auth_queue.pending_count, 0);
    }

    #[tokio::test]
    async fn stop_task_cancels_queued_jobs() {
        let (protocol, _store, _retriever) = protocol_with_retriever().await;
        let created = protocol.create_task("x".into(), None).await.unwrap();
        protocol.queue_targets(created.task_id, vec![Target::Query { text: "q".into() }]).await.unwrap();

        let stopped = protocol.stop_task(created.task_id, StopScope::AllJobs).await.unwrap();
        assert_eq!(stopped.cancelled_jobs, 1);
    }

    #[tokio::test]
    async fn get_materials_is_empty_before_any_evidence() {
        let (protocol, _store, _retriever) = protocol_with_retriever().await;
        let created = protocol.create_task("x".into(), None).await.unwrap();
        let materials = protocol.get_materials(created.task_id, true).await.unwrap();
        assert!(materials.claims.is_empty());
        assert!(materials.evidence_graph.is_some());
    }
}
