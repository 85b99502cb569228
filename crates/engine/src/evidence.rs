//! The Bayesian evidence graph: claims, the fragments and pages behind
//! them, and the supports/refutes/neutral/cites edges that connect them.
//! Confidence is the posterior mean of a Beta distribution whose shape
//! parameters accumulate from every (fragment→claim) edge's NLI
//! confidence weighted by the page's domain-category trust weight.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::store::{ClaimEvidence, EvidenceGraphView, Store};
use crate::types::{
    Claim, ClaimId, Edge, EdgeId, EdgeRelation, EndpointType, EvidenceError, Fragment, FragmentId,
    FragmentType, PageId, TaskId,
};

pub struct EvidenceGraph {
    store: Arc<dyn Store>,
}

/// The accumulated Beta(α, β) parameters behind a claim's confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BetaPosterior {
    pub alpha: f64,
    pub beta: f64,
}

impl BetaPosterior {
    pub const PRIOR: BetaPosterior = BetaPosterior { alpha: 1.0, beta: 1.0 };

    pub fn confidence(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn uncertainty(&self) -> f64 {
        let sum = self.alpha + self.beta;
        (self.alpha * self.beta / (sum * sum * (sum + 1.0))).sqrt()
    }

    pub fn controversy(&self) -> f64 {
        2.0 * self.alpha.min(self.beta) / (self.alpha + self.beta)
    }
}

impl EvidenceGraph {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn add_fragment(
        &self,
        page_id: PageId,
        fragment_type: FragmentType,
        text: String,
        heading_context: Option<String>,
        is_primary: bool,
        relevance_reason: String,
    ) -> Result<Option<FragmentId>, EvidenceError> {
        let fragment = Fragment {
            fragment_id: FragmentId::new(),
            page_id,
            fragment_type,
            text,
            heading_context,
            is_primary,
            relevance_reason,
        };
        self.store
            .insert_fragment(&fragment)
            .await
            .map_err(|e| EvidenceError::InvariantViolated(e.to_string()))
    }

    pub async fn add_claim(&self, task_id: TaskId, text: String, source_fragment_ids: Vec<FragmentId>) -> Result<ClaimId, EvidenceError> {
        let posterior = BetaPosterior::PRIOR;
        let claim = Claim {
            claim_id: ClaimId::new(),
            task_id,
            claim_text: text,
            confidence: posterior.confidence(),
            uncertainty: posterior.uncertainty(),
            controversy: posterior.controversy(),
            source_fragment_ids,
            verification_notes: None,
        };
        self.store
            .insert_claim(&claim)
            .await
            .map_err(|e| EvidenceError::InvariantViolated(e.to_string()))?;
        Ok(claim.claim_id)
    }

    pub async fn add_edge(
        &self,
        source_type: EndpointType,
        source_id: Uuid,
        target_type: EndpointType,
        target_id: Uuid,
        relation: EdgeRelation,
        nli_edge_confidence: f64,
        is_academic: bool,
        source_domain_category: crate::types::DomainCategory,
        target_domain_category: crate::types::DomainCategory,
        task_id: TaskId,
    ) -> Result<Option<EdgeId>, EvidenceError> {
        if source_type == target_type && source_id == target_id {
            return Err(EvidenceError::SelfLoop(source_id.to_string()));
        }
        let edge = Edge {
            edge_id: EdgeId::new(),
            source_type,
            source_id,
            target_type,
            target_id,
            relation,
            nli_edge_confidence,
            is_academic,
            source_domain_category,
            target_domain_category,
            task_id,
        };
        let inserted = self
            .store
            .insert_edge(&edge)
            .await
            .map_err(|e| EvidenceError::InvariantViolated(e.to_string()))?;

        if target_type == EndpointType::Claim {
            self.recompute_claim(ClaimId(target_id)).await?;
        }
        Ok(inserted)
    }

    pub async fn add_citation(
        &self,
        source_page: PageId,
        target_page: PageId,
        task_id: TaskId,
        source_domain_category: crate::types::DomainCategory,
        target_domain_category: crate::types::DomainCategory,
        is_academic: bool,
    ) -> Result<Option<EdgeId>, EvidenceError> {
        self.add_edge(
            EndpointType::Page,
            source_page.0,
            EndpointType::Page,
            target_page.0,
            EdgeRelation::Cites,
            1.0,
            is_academic,
            source_domain_category,
            target_domain_category,
            task_id,
        )
        .await
    }

    /// Recomputes `confidence`/`uncertainty`/`controversy` from the
    /// current (fragment→claim) edge set and persists the result.
    pub async fn recompute_claim(&self, claim_id: ClaimId) -> Result<BetaPosterior, EvidenceError> {
        let evidence = self
            .store
            .get_claim_evidence(claim_id)
            .await
            .map_err(|e| EvidenceError::InvariantViolated(e.to_string()))?
            .ok_or_else(|| EvidenceError::ClaimNotFound(claim_id.to_string()))?;

        let posterior = Self::posterior_from_evidence(&evidence);

        self.store
            .update_claim_scores(claim_id, posterior.confidence(), posterior.uncertainty(), posterior.controversy())
            .await
            .map_err(|e| EvidenceError::InvariantViolated(e.to_string()))?;

        Ok(posterior)
    }

    fn posterior_from_evidence(evidence: &ClaimEvidence) -> BetaPosterior {
        let mut posterior = BetaPosterior::PRIOR;
        for edge in &evidence.edges {
            if edge.source_type != EndpointType::Fragment {
                continue;
            }
            let Some(fragment) = evidence.fragments.iter().find(|f| f.fragment_id.0 == edge.source_id) else {
                continue;
            };
            let Some(page) = evidence.pages.iter().find(|p| p.page_id == fragment.page_id) else {
                continue;
            };
            let w_cat = page.domain_category.default_weight();
            let c = edge.nli_edge_confidence;
            match edge.relation {
                EdgeRelation::Supports => posterior.alpha += w_cat * c,
                EdgeRelation::Refutes => posterior.beta += w_cat * c,
                EdgeRelation::Neutral => {
                    posterior.alpha += 0.25 * w_cat * c;
                    posterior.beta += 0.25 * w_cat * c;
                }
                EdgeRelation::Cites => {}
            }
        }
        posterior
    }

    /// Number of distinct pages reached through the claim's supporting
    /// fragment edges, used to gate §3.4-style "needs more than one
    /// independent source" checks. Counted through the fragment's
    /// `page_id`, not by looking for a direct PAGE→CLAIM edge — no such
    /// edge exists in this schema.
    pub async fn independent_source_count(&self, claim_id: ClaimId) -> Result<usize, EvidenceError> {
        let evidence = self
            .store
            .get_claim_evidence(claim_id)
            .await
            .map_err(|e| EvidenceError::InvariantViolated(e.to_string()))?
            .ok_or_else(|| EvidenceError::ClaimNotFound(claim_id.to_string()))?;

        let pages: HashSet<PageId> = evidence
            .edges
            .iter()
            .filter(|e| e.source_type == EndpointType::Fragment && e.relation == EdgeRelation::Supports)
            .filter_map(|e| evidence.fragments.iter().find(|f| f.fragment_id.0 == e.source_id))
            .map(|f| f.page_id)
            .collect();
        Ok(pages.len())
    }

    pub async fn load_from_db(&self, task_id: TaskId) -> Result<EvidenceGraphView, EvidenceError> {
        self.store
            .load_evidence_graph(task_id)
            .await
            .map_err(|e| EvidenceError::InvariantViolated(e.to_string()))
    }

    pub async fn get_claim_evidence(&self, claim_id: ClaimId) -> Result<Option<ClaimEvidence>, EvidenceError> {
        self.store
            .get_claim_evidence(claim_id)
            .await
            .map_err(|e| EvidenceError::InvariantViolated(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{DomainCategory, PageType, Task, TaskBudget, TaskStatus};
    use chrono::Utc;

    async fn seeded_store() -> (Arc<SqliteStore>, TaskId, PageId) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let task = Task {
            task_id: TaskId::new(),
            hypothesis: "coffee causes long life".into(),
            status: TaskStatus::Exploring,
            created_at: Utc::now(),
            budget: TaskBudget::default(),
        };
        store.create_task(&task).await.unwrap();
        let page = crate::types::Page {
            page_id: PageId::new(),
            url: "https://trusted.example/a".into(),
            domain: "trusted.example".into(),
            domain_category: DomainCategory::Trusted,
            title: "A".into(),
            fetched_at: Utc::now(),
            html_path: None,
            paper_metadata: None,
            page_type: PageType::Web,
        };
        store.upsert_page(&page).await.unwrap();
        (store, task.task_id, page.page_id)
    }

    #[tokio::test]
    async fn single_support_edge_raises_confidence_above_half() {
        let (store, task_id, page_id) = seeded_store().await;
        let graph = EvidenceGraph::new(store.clone());

        let fragment_id = graph
            .add_fragment(page_id, FragmentType::Paragraph, "coffee drinkers live longer".into(), None, true, "matches hypothesis".into())
            .await
            .unwrap()
            .unwrap();
        let claim_id = graph.add_claim(task_id, "coffee causes long life".into(), vec![fragment_id]).await.unwrap();

        graph
            .add_edge(
                EndpointType::Fragment,
                fragment_id.0,
                EndpointType::Claim,
                claim_id.0,
                EdgeRelation::Supports,
                0.9,
                false,
                DomainCategory::Trusted,
                DomainCategory::Trusted,
                task_id,
            )
            .await
            .unwrap();

        let evidence = graph.get_claim_evidence(claim_id).await.unwrap().unwrap();
        assert!(evidence.claim.confidence > 0.5);
        assert_eq!(evidence.claim.uncertainty.is_nan(), false);
    }

    #[tokio::test]
    async fn refutation_lowers_confidence_and_raises_controversy() {
        let (store, task_id, page_id) = seeded_store().await;
        let graph = EvidenceGraph::new(store.clone());

        let f1 = graph
            .add_fragment(page_id, FragmentType::Paragraph, "supporting text".into(), None, true, "supports".into())
            .await
            .unwrap()
            .unwrap();
        let f2 = graph
            .add_fragment(page_id, FragmentType::Paragraph, "refuting text".into(), None, true, "refutes".into())
            .await
            .unwrap()
            .unwrap();
        let claim_id = graph.add_claim(task_id, "coffee causes long life".into(), vec![f1, f2]).await.unwrap();

        graph
            .add_edge(EndpointType::Fragment, f1.0, EndpointType::Claim, claim_id.0, EdgeRelation::Supports, 0.9, false, DomainCategory::Trusted, DomainCategory::Trusted, task_id)
            .await
            .unwrap();
        graph
            .add_edge(EndpointType::Fragment, f2.0, EndpointType::Claim, claim_id.0, EdgeRelation::Refutes, 0.8, false, DomainCategory::Trusted, DomainCategory::Trusted, task_id)
            .await
            .unwrap();

        let evidence = graph.get_claim_evidence(claim_id).await.unwrap().unwrap();
        assert!(evidence.claim.confidence < 0.5);
        assert!(evidence.claim.controversy > 0.6);
    }

    #[tokio::test]
    async fn independent_sources_counts_distinct_pages() {
        let (store, task_id, page_id) = seeded_store().await;
        let other_page = crate::types::Page {
            page_id: PageId::new(),
            url: "https://trusted.example/b".into(),
            domain: "trusted.example".into(),
            domain_category: DomainCategory::Trusted,
            title: "B".into(),
            fetched_at: Utc::now(),
            html_path: None,
            paper_metadata: None,
            page_type: PageType::Web,
        };
        store.upsert_page(&other_page).await.unwrap();

        let graph = EvidenceGraph::new(store.clone());
        let f1 = graph.add_fragment(page_id, FragmentType::Paragraph, "t1".into(), None, true, "r".into()).await.unwrap().unwrap();
        let f2 = graph.add_fragment(other_page.page_id, FragmentType::Paragraph, "t2".into(), None, true, "r".into()).await.unwrap().unwrap();
        let claim_id = graph.add_claim(task_id, "hypothesis".into(), vec![f1, f2]).await.unwrap();

        graph
            .add_edge(EndpointType::Fragment, f1.0, EndpointType::Claim, claim_id.0, EdgeRelation::Supports, 0.9, false, DomainCategory::Trusted, DomainCategory::Trusted, task_id)
            .await
            .unwrap();
        graph
            .add_edge(EndpointType::Fragment, f2.0, EndpointType::Claim, claim_id.0, EdgeRelation::Supports, 0.9, false, DomainCategory::Trusted, DomainCategory::Trusted, task_id)
            .await
            .unwrap();

        assert_eq!(graph.independent_source_count(claim_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn self_loop_is_rejected() {
        let (store, task_id, _page_id) = seeded_store().await;
        let graph = EvidenceGraph::new(store);
        let id = Uuid::new_v4();
        let err = graph
            .add_edge(EndpointType::Claim, id, EndpointType::Claim, id, EdgeRelation::Supports, 0.9, false, DomainCategory::Trusted, DomainCategory::Trusted, task_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EvidenceError::SelfLoop(_)));
    }
}
