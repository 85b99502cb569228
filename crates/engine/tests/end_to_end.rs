//! Exercises the scheduler, intervention queue, and evidence graph together
//! through the `Protocol` façade, the way a caller outside this crate would.

use std::sync::Arc;

use chrono::Utc;
use lyra_engine::intervention::InterventionQueue;
use lyra_engine::metrics::MetricsRegistry;
use lyra_engine::protocol::Protocol;
use lyra_engine::scheduler::{JobHandler, JobOutcome, Scheduler, StopScope};
use lyra_engine::store::{SqliteStore, Store};
use lyra_engine::traits::unconfigured::UnconfiguredFetcher;
use lyra_engine::types::{
    AuthType, Claim, ClaimId, DomainCategory, Edge, EdgeId, EdgeRelation, EndpointType, Fragment,
    FragmentId, FragmentType, Intervention, InterventionId, InterventionStatus, Job, JobId,
    JobKind, JobState, Page, PageId, PageType, Priority, Target,
};

struct NoopHandler;

#[async_trait::async_trait]
impl JobHandler for NoopHandler {
    async fn handle(&self, _job: &Job) -> JobOutcome {
        JobOutcome::Completed
    }
}

fn protocol_stack() -> (Arc<Protocol>, Arc<dyn Store>, Arc<Scheduler>) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut handlers = std::collections::HashMap::new();
    let handler: Arc<dyn JobHandler> = Arc::new(NoopHandler);
    for kind in [JobKind::Search, JobKind::IngestDoi, JobKind::IngestUrl, JobKind::CitationGraph, JobKind::VerifyNli] {
        handlers.insert(kind, handler.clone());
    }
    let scheduler = Scheduler::new(store.clone(), handlers, 0);
    let interventions = InterventionQueue::new(store.clone(), Arc::new(UnconfiguredFetcher));
    let metrics = MetricsRegistry::new();
    let protocol = Arc::new(Protocol::new(store.clone(), scheduler.clone(), interventions, metrics));
    (protocol, store, scheduler)
}

/// Scenario 6 from the testable-properties list: stop a task mid-flight and
/// confirm remaining jobs cancel while already-completed evidence survives.
#[tokio::test]
async fn stop_task_mid_flight_cancels_remaining_jobs_and_keeps_evidence() {
    let (protocol, store, _scheduler) = protocol_stack();

    let created = protocol.create_task("coffee causes long life".into(), None).await.unwrap();
    let targets: Vec<Target> = (0..10).map(|i| Target::Query { text: format!("query {i}") }).collect();
    let queued = protocol.queue_targets(created.task_id, targets).await.unwrap();
    assert_eq!(queued.job_ids.len(), 10);

    // Simulate two searches finishing before the stop arrives.
    for _ in 0..2 {
        let job = store.claim_next_job("worker-1", &[JobKind::Search]).await.unwrap().expect("a queued search job");
        store.complete_job(job.job_id).await.unwrap();
    }

    let page = Page {
        page_id: PageId::new(),
        url: "https://example.org/a".into(),
        domain: "example.org".into(),
        domain_category: DomainCategory::Trusted,
        title: "A".into(),
        fetched_at: Utc::now(),
        html_path: None,
        paper_metadata: None,
        page_type: PageType::Web,
    };
    store.upsert_page(&page).await.unwrap();
    let fragment = Fragment {
        fragment_id: FragmentId::new(),
        page_id: page.page_id,
        fragment_type: FragmentType::Paragraph,
        text: "coffee drinkers live longer".into(),
        heading_context: None,
        is_primary: true,
        relevance_reason: "supports hypothesis".into(),
    };
    store.insert_fragment(&fragment).await.unwrap();
    let claim = Claim {
        claim_id: ClaimId::new(),
        task_id: created.task_id,
        claim_text: "coffee drinkers live longer".into(),
        confidence: 0.8,
        uncertainty: 0.1,
        controversy: 0.0,
        source_fragment_ids: vec![fragment.fragment_id],
        verification_notes: None,
    };
    store.insert_claim(&claim).await.unwrap();
    store
        .insert_edge(&Edge {
            edge_id: EdgeId::new(),
            source_type: EndpointType::Fragment,
            source_id: fragment.fragment_id.0,
            target_type: EndpointType::Claim,
            target_id: claim.claim_id.0,
            relation: EdgeRelation::Supports,
            nli_edge_confidence: 0.9,
            is_academic: false,
            source_domain_category: DomainCategory::Trusted,
            target_domain_category: DomainCategory::Trusted,
            task_id: created.task_id,
        })
        .await
        .unwrap();

    let stopped = protocol.stop_task(created.task_id, StopScope::AllJobs).await.unwrap();
    assert_eq!(stopped.cancelled_jobs, 8);

    let jobs = store.list_jobs_for_task(created.task_id).await.unwrap();
    let cancelled = jobs.iter().filter(|j| j.state == JobState::Cancelled).count();
    let completed = jobs.iter().filter(|j| j.state == JobState::Completed).count();
    assert_eq!(cancelled, 8);
    assert_eq!(completed, 2);

    let materials = protocol.get_materials(created.task_id, false).await.unwrap();
    assert_eq!(materials.claims.len(), 1);
    assert_eq!(materials.claims[0].sources.len(), 1);
    assert!(!materials.claims[0].has_refutation);
}

/// Scenario 3: a CAPTCHA parks a job, `get_auth_queue` surfaces it, and
/// `resolve_auth` requeues it for another attempt.
#[tokio::test]
async fn captcha_parks_then_resolve_auth_requeues_job() {
    let (protocol, store, _scheduler) = protocol_stack();
    let created = protocol.create_task("x".into(), None).await.unwrap();

    let job = Job {
        job_id: JobId::new(),
        task_id: created.task_id,
        kind: JobKind::IngestUrl,
        payload: serde_json::json!({ "url": "https://paywalled.example/a" }),
        payload_hash: "h".into(),
        priority: Priority::Normal,
        state: JobState::AwaitingAuth,
        attempts: 1,
        created_at: Utc::now(),
        claim_token: None,
        last_error: None,
    };
    store.enqueue_job(&job).await.unwrap();

    let queue_id = InterventionId::new();
    store
        .intervention_enqueue(&Intervention {
            queue_id,
            task_id: created.task_id,
            url: "https://paywalled.example/a".into(),
            domain: "paywalled.example".into(),
            auth_type: AuthType::Login,
            status: InterventionStatus::Pending,
            search_job_id: Some(job.job_id),
            session_data: None,
        })
        .await
        .unwrap();

    let pending = protocol.get_auth_queue(created.task_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].domain, "paywalled.example");

    let resolved = protocol
        .resolve_auth(queue_id, Some(serde_json::json!({"cookies": []})))
        .await
        .unwrap();
    assert_eq!(resolved.requeued_jobs, 1);

    let jobs = store.list_jobs_for_task(created.task_id).await.unwrap();
    assert_eq!(jobs[0].state, JobState::Queued);

    let pending_after = protocol.get_auth_queue(created.task_id).await.unwrap();
    assert!(pending_after.is_empty());
}
