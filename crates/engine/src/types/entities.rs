//! Persisted entities and the enums that classify them. Mirrors the data
//! model: the Store owns every row here, other components hold identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ClaimId, EdgeId, FragmentId, InterventionId, JobId, PageId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Exploring,
    Paused,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBudget {
    pub pages_limit: u32,
    pub time_limit_s: u64,
}

impl Default for TaskBudget {
    fn default() -> Self {
        Self {
            pages_limit: 200,
            time_limit_s: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub hypothesis: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub budget: TaskBudget,
}

/// A unit of scheduler input. Not persisted on its own; it is translated
/// into one or more `Job` rows by `queue_targets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Query { text: String },
    Doi { value: String },
    Url { value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Search,
    IngestDoi,
    IngestUrl,
    CitationGraph,
    VerifyNli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    AwaitingAuth,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub payload_hash: String,
    pub priority: Priority,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub claim_token: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainCategory {
    Trusted,
    Academic,
    News,
    Technical,
    General,
    Unknown,
}

impl DomainCategory {
    /// Default page-category weight used by the Bayesian confidence
    /// calculation (`w_cat`). Overridable per deployment via configuration.
    pub fn default_weight(self) -> f64 {
        match self {
            DomainCategory::Trusted => 1.0,
            DomainCategory::Academic => 0.9,
            DomainCategory::News => 0.6,
            DomainCategory::Technical => 0.55,
            DomainCategory::General => 0.4,
            DomainCategory::Unknown => 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Web,
    AcademicPaper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperMetadata {
    pub paper_id: String,
    pub doi: Option<String>,
    pub venue: Option<String>,
    pub year: Option<u32>,
    pub citation_count: Option<u32>,
    pub is_open_access: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub page_id: PageId,
    pub url: String,
    pub domain: String,
    pub domain_category: DomainCategory,
    pub title: String,
    pub fetched_at: DateTime<Utc>,
    pub html_path: Option<String>,
    pub paper_metadata: Option<PaperMetadata>,
    pub page_type: PageType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    Paragraph,
    Abstract,
    HeadingContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub fragment_id: FragmentId,
    pub page_id: PageId,
    pub fragment_type: FragmentType,
    pub text: String,
    pub heading_context: Option<String>,
    /// Whether this fragment came from a source the Retriever classified as
    /// primary (author-published text, not a secondary summary). Drives
    /// `verify_nli` enqueuing and the `is_primary` flag on `get_materials`
    /// sources. The fragment's URL is never duplicated here — it is read
    /// through `page_id`.
    pub is_primary: bool,
    pub relevance_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: ClaimId,
    pub task_id: TaskId,
    pub claim_text: String,
    pub confidence: f64,
    pub uncertainty: f64,
    pub controversy: f64,
    pub source_fragment_ids: Vec<FragmentId>,
    /// Free-text reviewer note attached by `feedback(claim_mark, …)`.
    /// Never encodes source URLs or other structured data; those are
    /// derived by joining `source_fragment_ids` through to their pages.
    pub verification_notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Fragment,
    Claim,
    Page,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRelation {
    Supports,
    Refutes,
    Neutral,
    Cites,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub edge_id: EdgeId,
    pub source_type: EndpointType,
    pub source_id: uuid::Uuid,
    pub target_type: EndpointType,
    pub target_id: uuid::Uuid,
    pub relation: EdgeRelation,
    pub nli_edge_confidence: f64,
    pub is_academic: bool,
    pub source_domain_category: DomainCategory,
    pub target_domain_category: DomainCategory,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Captcha,
    Cloudflare,
    Turnstile,
    Login,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub queue_id: InterventionId,
    pub task_id: TaskId,
    pub url: String,
    pub domain: String,
    pub auth_type: AuthType,
    pub status: InterventionStatus,
    pub search_job_id: Option<JobId>,
    pub session_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub engine: String,
    pub success_rate_1h: f64,
    pub success_rate_24h: f64,
    pub captcha_rate: f64,
    pub median_latency_ms: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self {
            engine: String::new(),
            success_rate_1h: 1.0,
            success_rate_24h: 1.0,
            captcha_rate: 0.0,
            median_latency_ms: 500.0,
            last_used_at: None,
            circuit_state: CircuitState::Closed,
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainBudget {
    pub domain: String,
    pub date: chrono::NaiveDate,
    pub requests_today: u32,
    pub pages_today: u32,
    pub max_requests_per_day: u32,
    pub max_pages_per_day: u32,
}

/// In-memory, per-`Retriever::search` call bookkeeping for the canonical
/// paper index. Never persisted directly; it collapses into `Page` /
/// `Fragment` rows before the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalSource {
    Api,
    Serp,
    Both,
}
