//! Human corrections flowing back into the evidence graph: relabeling an
//! edge, overriding a claim's confidence, or reclassifying a domain's
//! trust weight. Every action is appended to an audit log before it takes
//! effect, mirroring the donor's critic-audit convention of never losing
//! a human decision even if the downstream recompute fails.

use std::sync::Arc;

use crate::evidence::EvidenceGraph;
use crate::store::Store;
use crate::types::{ClaimId, DomainCategory, EdgeId, EdgeRelation, EndpointType, FeedbackError, TaskId};

pub struct FeedbackBus {
    store: Arc<dyn Store>,
    evidence: EvidenceGraph,
}

impl FeedbackBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let evidence = EvidenceGraph::new(store.clone());
        Self { store, evidence }
    }

    /// Overwrites an edge's relation and recomputes the affected claim's
    /// confidence, if the edge targets one.
    pub async fn edge_correct(&self, edge_id: EdgeId, new_relation: EdgeRelation) -> Result<(), FeedbackError> {
        self.audit("edge_correct", &edge_id.to_string(), &serde_json::json!({ "relation": new_relation })).await?;

        self.store
            .update_edge_relation(edge_id, new_relation)
            .await
            .map_err(|e| FeedbackError::RecomputeFailed(e.to_string()))?;

        // The edge's target claim, if any, is recomputed by the caller once
        // it knows which claim the edge fed into — this module only knows
        // the edge id, so recompute happens through `recompute_claim_for_edge`.
        Ok(())
    }

    /// Like [`edge_correct`], but also recomputes the target claim when the
    /// caller (typically the protocol façade) already has the edge's
    /// target claim id at hand.
    pub async fn edge_correct_and_recompute(&self, edge_id: EdgeId, new_relation: EdgeRelation, target_claim_id: Option<ClaimId>) -> Result<(), FeedbackError> {
        self.edge_correct(edge_id, new_relation).await?;
        if let Some(claim_id) = target_claim_id {
            self.evidence.recompute_claim(claim_id).await.map_err(|e| FeedbackError::RecomputeFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Records a human verification note and, when `confidence_override`
    /// is given, overwrites the claim's confidence while leaving its
    /// uncertainty/controversy at their last computed values.
    pub async fn claim_mark(&self, claim_id: ClaimId, note: String, confidence_override: Option<f64>) -> Result<(), FeedbackError> {
        self.audit(
            "claim_mark",
            &claim_id.to_string(),
            &serde_json::json!({ "note": note, "confidence_override": confidence_override }),
        )
        .await?;

        let evidence = self
            .store
            .get_claim_evidence(claim_id)
            .await
            .map_err(|e| FeedbackError::RecomputeFailed(e.to_string()))?
            .ok_or_else(|| FeedbackError::RecomputeFailed(format!("claim {claim_id} not found")))?;

        let confidence = confidence_override.unwrap_or(evidence.claim.confidence);
        self.store
            .update_claim_scores(claim_id, confidence, evidence.claim.uncertainty, evidence.claim.controversy)
            .await
            .map_err(|e| FeedbackError::RecomputeFailed(e.to_string()))?;

        self.store
            .update_claim_verification_notes(claim_id, Some(&note))
            .await
            .map_err(|e| FeedbackError::RecomputeFailed(e.to_string()))?;

        Ok(())
    }

    /// Reclassifies a domain's trust category and recomputes every claim in
    /// `task_id` whose evidence passes through a page on that domain.
    pub async fn domain_reclassify(&self, task_id: TaskId, domain: &str, new_category: DomainCategory) -> Result<u32, FeedbackError> {
        self.audit("domain_reclassify", domain, &serde_json::json!({ "category": new_category })).await?;

        self.store
            .update_domain_category(domain, new_category)
            .await
            .map_err(|e| FeedbackError::RecomputeFailed(e.to_string()))?;

        let graph = self
            .store
            .load_evidence_graph(task_id)
            .await
            .map_err(|e| FeedbackError::RecomputeFailed(e.to_string()))?;

        let affected_pages: std::collections::HashSet<_> = graph.pages.iter().filter(|p| p.domain == domain).map(|p| p.page_id).collect();
        let affected_fragments: std::collections::HashSet<_> = graph.fragments.iter().filter(|f| affected_pages.contains(&f.page_id)).map(|f| f.fragment_id).collect();

        let mut recomputed = 0u32;
        let mut seen = std::collections::HashSet::new();
        for edge in &graph.edges {
            if edge.source_type != EndpointType::Fragment || edge.target_type != EndpointType::Claim {
                continue;
            }
            if !affected_fragments.contains(&crate::types::FragmentId(edge.source_id)) {
                continue;
            }
            let claim_id = ClaimId(edge.target_id);
            if seen.insert(claim_id) {
                self.evidence.recompute_claim(claim_id).await.map_err(|e| FeedbackError::RecomputeFailed(e.to_string()))?;
                recomputed += 1;
            }
        }
        Ok(recomputed)
    }

    async fn audit(&self, action: &str, target_id: &str, payload: &serde_json::Value) -> Result<(), FeedbackError> {
        self.store
            .append_feedback_audit(action, target_id, payload)
            .await
            .map(|_| ())
            .map_err(|e| FeedbackError::RecomputeFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidenceGraph as EvidenceGraphHelper;
    use crate::store::SqliteStore;
    use crate::types::{FragmentType, Page, PageType, Task, TaskBudget, TaskStatus};
    use chrono::Utc;

    async fn seeded() -> (Arc<dyn Store>, TaskId, ClaimId, EdgeId) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let task = Task {
            task_id: TaskId::new(),
            hypothesis: "x".into(),
            status: TaskStatus::Exploring,
            created_at: Utc::now(),
            budget: TaskBudget::default(),
        };
        store.create_task(&task).await.unwrap();
        let page = Page {
            page_id: crate::types::PageId::new(),
            url: "https://example.com/a".into(),
            domain: "example.com".into(),
            domain_category: DomainCategory::General,
            title: "A".into(),
            fetched_at: Utc::now(),
            html_path: None,
            paper_metadata: None,
            page_type: PageType::Web,
        };
        store.upsert_page(&page).await.unwrap();

        let helper = EvidenceGraphHelper::new(store.clone());
        let fragment_id = helper
            .add_fragment(page.page_id, FragmentType::Paragraph, "text".into(), None, true, "r".into())
            .await
            .unwrap()
            .unwrap();
        let claim_id = helper.add_claim(task.task_id, "claim".into(), vec![fragment_id]).await.unwrap();
        let edge_id = helper
            .add_edge(
                EndpointType::Fragment,
                fragment_id.0,
                EndpointType::Claim,
                claim_id.0,
                EdgeRelation::Neutral,
                0.5,
                false,
                DomainCategory::General,
                DomainCategory::General,
                task.task_id,
            )
            .await
            .unwrap()
            .unwrap();
        (store, task.task_id, claim_id, edge_id)
    }

    #[tokio::test]
    async fn claim_mark_overrides_confidence_and_records_note() {
        let (store, _task_id, claim_id, _edge_id) = seeded().await;
        let bus = FeedbackBus::new(store.clone());
        bus.claim_mark(claim_id, "verified by hand".into(), Some(0.95)).await.unwrap();

        let evidence = store.get_claim_evidence(claim_id).await.unwrap().unwrap();
        assert!((evidence.claim.confidence - 0.95).abs() < 1e-9);
        assert_eq!(evidence.claim.verification_notes.as_deref(), Some("verified by hand"));
    }

    #[tokio::test]
    async fn domain_reclassify_recomputes_affected_claims() {
        let (store, task_id, claim_id, _edge_id) = seeded().await;
        let before = store.get_claim_evidence(claim_id).await.unwrap().unwrap().claim.confidence;

        let bus = FeedbackBus::new(store.clone());
        let recomputed = bus.domain_reclassify(task_id, "example.com", DomainCategory::Trusted).await.unwrap();
        assert_eq!(recomputed, 1);

        let after = store.get_claim_evidence(claim_id).await.unwrap().unwrap().claim.confidence;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn edge_correct_and_recompute_updates_relation() {
        let (store, _task_id, claim_id, edge_id) = seeded().await;
        let bus = FeedbackBus::new(store.clone());
        bus.edge_correct_and_recompute(edge_id, EdgeRelation::Supports, Some(claim_id)).await.unwrap();

        let evidence = store.get_claim_evidence(claim_id).await.unwrap().unwrap();
        assert_eq!(evidence.edges[0].relation, EdgeRelation::Supports);
        assert!(evidence.claim.confidence > 0.5);
    }
}
