//! The durable store: tasks, jobs, pages, fragments, claims, edges,
//! interventions, engine health, domain budgets, and the feedback audit
//! log. Backed by SQLite in WAL mode behind a single async mutex, matching
//! the donor job-store's "serialize writers, let readers share the
//! connection" trade-off — this workload's I/O is dominated by network
//! fetches, not store contention.

mod schema;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::types::{
    Claim, ClaimId, DomainBudget, Edge, EdgeId, EndpointType, EngineHealth, Fragment, FragmentId,
    Intervention, InterventionId, InterventionStatus, Job, JobId, JobKind, JobState, Page, PageId,
    Priority, StoreError, Task, TaskId, TaskStatus,
};

use schema::OptionalExt;

/// `sha256(text)` used to deduplicate fragments and to key the
/// content-addressed object store mentioned in §6.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn payload_hash(payload: &serde_json::Value) -> String {
    content_hash(&payload.to_string())
}

/// A persisted record of one `search()` call, queried back by
/// `Protocol::get_status` to report per-search progress.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchRecord {
    pub search_id: String,
    pub task_id: TaskId,
    pub query: String,
    pub status: crate::retriever::SearchStatus,
    pub pages_fetched: u32,
    pub useful_fragments: u32,
    pub harvest_rate: f64,
    pub novelty_score: f64,
    pub claims_found: u32,
    pub has_primary_source: bool,
    pub created_at: DateTime<Utc>,
}

/// Graph query result for `load_evidence_graph`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EvidenceGraphView {
    pub claims: Vec<Claim>,
    pub fragments: Vec<Fragment>,
    pub pages: Vec<Page>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClaimEvidence {
    pub claim: Claim,
    pub edges: Vec<Edge>,
    pub fragments: Vec<Fragment>,
    pub pages: Vec<Page>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;
    async fn update_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError>;
    async fn load_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Deduplicates on `(task_id, kind, payload_hash)` against non-terminal
    /// rows. Returns `None` when an existing non-terminal job matched.
    async fn enqueue_job(&self, job: &Job) -> Result<Option<JobId>, StoreError>;
    async fn claim_next_job(&self, worker_id: &str, acceptable_kinds: &[JobKind]) -> Result<Option<Job>, StoreError>;
    async fn complete_job(&self, job_id: JobId) -> Result<(), StoreError>;
    async fn fail_job(&self, job_id: JobId, error: &str, terminal: bool) -> Result<(), StoreError>;
    async fn park_job_awaiting_auth(&self, job_id: JobId) -> Result<(), StoreError>;
    async fn requeue_jobs_for_domain(&self, domain: &str) -> Result<u32, StoreError>;
    async fn cancel_non_terminal_jobs(&self, task_id: TaskId, kinds_excluded: &[JobKind]) -> Result<u32, StoreError>;
    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;
    async fn list_jobs_for_task(&self, task_id: TaskId) -> Result<Vec<Job>, StoreError>;

    async fn upsert_page(&self, page: &Page) -> Result<(), StoreError>;
    async fn insert_fragment(&self, fragment: &Fragment) -> Result<Option<FragmentId>, StoreError>;
    async fn insert_claim(&self, claim: &Claim) -> Result<(), StoreError>;
    async fn update_claim_scores(&self, claim_id: ClaimId, confidence: f64, uncertainty: f64, controversy: f64) -> Result<(), StoreError>;
    async fn update_claim_verification_notes(&self, claim_id: ClaimId, notes: Option<&str>) -> Result<(), StoreError>;
    async fn insert_edge(&self, edge: &Edge) -> Result<Option<EdgeId>, StoreError>;
    async fn update_edge_relation(&self, edge_id: EdgeId, relation: crate::types::EdgeRelation) -> Result<(), StoreError>;
    async fn get_page(&self, page_id: PageId) -> Result<Option<Page>, StoreError>;
    async fn get_page_by_url(&self, url: &str) -> Result<Option<Page>, StoreError>;
    async fn list_pages_by_domain(&self, domain: &str) -> Result<Vec<Page>, StoreError>;
    async fn update_domain_category(&self, domain: &str, category: crate::types::DomainCategory) -> Result<u32, StoreError>;

    async fn record_engine_result(&self, health: &EngineHealth) -> Result<(), StoreError>;
    async fn get_engine_health(&self, engine: &str) -> Result<Option<EngineHealth>, StoreError>;
    async fn increment_domain_counters(&self, domain: &str, requests: u32, pages: u32) -> Result<(), StoreError>;
    async fn get_domain_budget(&self, domain: &str) -> Result<Option<DomainBudget>, StoreError>;
    async fn set_domain_caps(&self, domain: &str, max_requests_per_day: u32, max_pages_per_day: u32) -> Result<(), StoreError>;

    async fn intervention_enqueue(&self, intervention: &Intervention) -> Result<(), StoreError>;
    async fn intervention_get(&self, queue_id: InterventionId) -> Result<Option<Intervention>, StoreError>;
    async fn intervention_mark_in_progress(&self, queue_id: InterventionId) -> Result<(), StoreError>;
    async fn intervention_resolve(&self, queue_id: InterventionId, session_data: Option<serde_json::Value>) -> Result<(), StoreError>;
    async fn intervention_list_pending(&self, task_id: Option<TaskId>) -> Result<Vec<Intervention>, StoreError>;
    async fn intervention_capture_session(&self, domain: &str, session_data: serde_json::Value) -> Result<(), StoreError>;
    async fn intervention_get_session_for_domain(&self, domain: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn load_evidence_graph(&self, task_id: TaskId) -> Result<EvidenceGraphView, StoreError>;
    async fn get_claim_evidence(&self, claim_id: ClaimId) -> Result<Option<ClaimEvidence>, StoreError>;

    async fn record_search(&self, record: &SearchRecord) -> Result<(), StoreError>;
    async fn list_searches_for_task(&self, task_id: TaskId) -> Result<Vec<SearchRecord>, StoreError>;

    async fn append_feedback_audit(&self, action: &str, target_id: &str, payload: &serde_json::Value) -> Result<i64, StoreError>;
}

pub struct SqliteStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Sqlite(e.to_string()))?;
            }
        }
        let conn = rusqlite::Connection::open(path).map_err(|e| StoreError::Sqlite(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        schema::init_schema(&conn)?;
        let store = Self {
            conn: tokio::sync::Mutex::new(conn),
        };
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| StoreError::Sqlite(e.to_string()))?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Crash-safe restart policy (§4.1): every `{queued, running}` job is
    /// reset to `failed` with a reserved reason. Deliberately not resumed;
    /// the client must re-submit.
    pub async fn reset_incomplete_jobs(&self) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE jobs SET state = ?1, claim_token = NULL, last_error = ?2
                 WHERE state IN (?3, ?4)",
                rusqlite::params![
                    enum_to_str(&JobState::Failed),
                    "server_restart_reset",
                    enum_to_str(&JobState::Queued),
                    enum_to_str(&JobState::Running),
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows as u32)
    }
}

fn enum_to_str<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("enum serialization is infallible")
}

fn str_to_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Priority sorts numerically in SQL (`ORDER BY priority DESC`), so it is
/// stored as its discriminant rather than the JSON string the other enums use.
fn priority_to_i64(p: Priority) -> i64 {
    p as i64
}

fn i64_to_priority(v: i64) -> Result<Priority, StoreError> {
    match v {
        0 => Ok(Priority::Low),
        1 => Ok(Priority::Normal),
        2 => Ok(Priority::High),
        3 => Ok(Priority::Critical),
        other => Err(StoreError::Serialization(format!("invalid priority rank: {other}"))),
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Result<Task, StoreError>> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    Ok((|| {
        Ok(Task {
            task_id: parse_id(row.get::<_, String>(0)?)?,
            hypothesis: row.get(1)?,
            status: str_to_enum(&status)?,
            created_at: parse_ts(&created_at)?,
            budget: crate::types::TaskBudget {
                pages_limit: row.get::<_, i64>(4)? as u32,
                time_limit_s: row.get::<_, i64>(5)? as u64,
            },
        })
    })())
}

fn parse_id<T: std::str::FromStr>(raw: String) -> Result<T, StoreError> {
    raw.parse::<T>()
        .map_err(|_| StoreError::Serialization(format!("invalid id: {raw}")))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Result<Job, StoreError>> {
    Ok((|| {
        let payload_raw: String = row.get(3)?;
        Ok(Job {
            job_id: parse_id(row.get::<_, String>(0)?)?,
            task_id: parse_id(row.get::<_, String>(1)?)?,
            kind: str_to_enum(&row.get::<_, String>(2)?)?,
            payload: serde_json::from_str(&payload_raw).map_err(|e| StoreError::Serialization(e.to_string()))?,
            payload_hash: row.get(4)?,
            priority: i64_to_priority(row.get::<_, i64>(5)?)?,
            state: str_to_enum(&row.get::<_, String>(6)?)?,
            attempts: row.get::<_, i64>(7)? as u32,
            created_at: parse_ts(&row.get::<_, String>(8)?)?,
            claim_token: row.get(9)?,
            last_error: row.get(10)?,
        })
    })())
}

const JOB_COLUMNS: &str = "job_id, task_id, kind, payload, payload_hash, priority, state, attempts, created_at, claim_token, last_error";

fn row_to_page(row: &rusqlite::Row) -> rusqlite::Result<Result<Page, StoreError>> {
    Ok((|| {
        let paper_raw: Option<String> = row.get(7)?;
        Ok(Page {
            page_id: parse_id(row.get::<_, String>(0)?)?,
            url: row.get(1)?,
            domain: row.get(2)?,
            domain_category: str_to_enum(&row.get::<_, String>(3)?)?,
            title: row.get(4)?,
            fetched_at: parse_ts(&row.get::<_, String>(5)?)?,
            html_path: row.get(6)?,
            paper_metadata: paper_raw
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            page_type: str_to_enum(&row.get::<_, String>(8)?)?,
        })
    })())
}

const PAGE_COLUMNS: &str = "page_id, url, domain, domain_category, title, fetched_at, html_path, paper_metadata, page_type";

fn row_to_fragment(row: &rusqlite::Row) -> rusqlite::Result<Result<Fragment, StoreError>> {
    Ok((|| {
        Ok(Fragment {
            fragment_id: parse_id(row.get::<_, String>(0)?)?,
            page_id: parse_id(row.get::<_, String>(1)?)?,
            fragment_type: str_to_enum(&row.get::<_, String>(2)?)?,
            text: row.get(3)?,
            heading_context: row.get(5)?,
            is_primary: row.get::<_, i64>(6)? != 0,
            relevance_reason: row.get(7)?,
        })
    })())
}

const FRAGMENT_COLUMNS: &str = "fragment_id, page_id, fragment_type, text, text_hash, heading_context, is_primary, relevance_reason";

fn row_to_claim(row: &rusqlite::Row) -> rusqlite::Result<Result<Claim, StoreError>> {
    Ok((|| {
        let sources_raw: String = row.get(5)?;
        Ok(Claim {
            claim_id: parse_id(row.get::<_, String>(0)?)?,
            task_id: parse_id(row.get::<_, String>(1)?)?,
            claim_text: row.get(2)?,
            confidence: row.get(3)?,
            uncertainty: row.get(4)?,
            controversy: row.get::<_, f64>(6)?,
            source_fragment_ids: serde_json::from_str(&sources_raw).map_err(|e| StoreError::Serialization(e.to_string()))?,
            verification_notes: row.get::<_, Option<String>>(7)?,
        })
    })())
}

const CLAIM_COLUMNS: &str = "claim_id, task_id, claim_text, confidence, uncertainty, source_fragment_ids, controversy, verification_notes";

fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<Result<Edge, StoreError>> {
    Ok((|| {
        Ok(Edge {
            edge_id: parse_id(row.get::<_, String>(0)?)?,
            source_type: str_to_enum(&row.get::<_, String>(1)?)?,
            source_id: row.get::<_, String>(2)?.parse().map_err(|_| StoreError::Serialization("bad uuid".into()))?,
            target_type: str_to_enum(&row.get::<_, String>(3)?)?,
            target_id: row.get::<_, String>(4)?.parse().map_err(|_| StoreError::Serialization("bad uuid".into()))?,
            relation: str_to_enum(&row.get::<_, String>(5)?)?,
            nli_edge_confidence: row.get(6)?,
            is_academic: row.get::<_, i64>(7)? != 0,
            source_domain_category: str_to_enum(&row.get::<_, String>(8)?)?,
            target_domain_category: str_to_enum(&row.get::<_, String>(9)?)?,
            task_id: parse_id(row.get::<_, String>(10)?)?,
        })
    })())
}

const EDGE_COLUMNS: &str = "edge_id, source_type, source_id, target_type, target_id, relation, nli_edge_confidence, is_academic, source_domain_category, target_domain_category, task_id";

fn row_to_intervention(row: &rusqlite::Row) -> rusqlite::Result<Result<Intervention, StoreError>> {
    Ok((|| {
        let search_job_id: Option<String> = row.get(6)?;
        let session_raw: Option<String> = row.get(7)?;
        Ok(Intervention {
            queue_id: parse_id(row.get::<_, String>(0)?)?,
            task_id: parse_id(row.get::<_, String>(1)?)?,
            url: row.get(2)?,
            domain: row.get(3)?,
            auth_type: str_to_enum(&row.get::<_, String>(4)?)?,
            status: str_to_enum(&row.get::<_, String>(5)?)?,
            search_job_id: search_job_id.map(parse_id).transpose()?,
            session_data: session_raw
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        })
    })())
}

const INTERVENTION_COLUMNS: &str = "queue_id, task_id, url, domain, auth_type, status, search_job_id, session_data";

fn row_to_health(row: &rusqlite::Row) -> rusqlite::Result<Result<EngineHealth, StoreError>> {
    Ok((|| {
        let last_used: Option<String> = row.get(5)?;
        let cooldown: Option<String> = row.get(8)?;
        Ok(EngineHealth {
            engine: row.get(0)?,
            success_rate_1h: row.get(1)?,
            success_rate_24h: row.get(2)?,
            captcha_rate: row.get(3)?,
            median_latency_ms: row.get(4)?,
            last_used_at: last_used.map(|s| parse_ts(&s)).transpose()?,
            circuit_state: str_to_enum(&row.get::<_, String>(6)?)?,
            consecutive_failures: row.get::<_, i64>(7)? as u32,
            cooldown_until: cooldown.map(|s| parse_ts(&s)).transpose()?,
        })
    })())
}

const HEALTH_COLUMNS: &str = "engine, success_rate_1h, success_rate_24h, captcha_rate, median_latency_ms, last_used_at, circuit_state, consecutive_failures, cooldown_until";

fn row_to_budget(row: &rusqlite::Row) -> rusqlite::Result<Result<DomainBudget, StoreError>> {
    Ok((|| {
        let date_raw: String = row.get(1)?;
        Ok(DomainBudget {
            domain: row.get(0)?,
            date: chrono::NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d").map_err(|e| StoreError::Serialization(e.to_string()))?,
            requests_today: row.get::<_, i64>(2)? as u32,
            pages_today: row.get::<_, i64>(3)? as u32,
            max_requests_per_day: row.get::<_, i64>(4)? as u32,
            max_pages_per_day: row.get::<_, i64>(5)? as u32,
        })
    })())
}

const BUDGET_COLUMNS: &str = "domain, date, requests_today, pages_today, max_requests_per_day, max_pages_per_day";

fn row_to_search(row: &rusqlite::Row) -> rusqlite::Result<Result<SearchRecord, StoreError>> {
    Ok((|| {
        Ok(SearchRecord {
            search_id: row.get(0)?,
            task_id: parse_id(row.get::<_, String>(1)?)?,
            query: row.get(2)?,
            status: str_to_enum(&row.get::<_, String>(3)?)?,
            pages_fetched: row.get::<_, i64>(4)? as u32,
            useful_fragments: row.get::<_, i64>(5)? as u32,
            harvest_rate: row.get(6)?,
            novelty_score: row.get(7)?,
            claims_found: row.get::<_, i64>(8)? as u32,
            has_primary_source: row.get::<_, i64>(9)? != 0,
            created_at: parse_ts(&row.get::<_, String>(10)?)?,
        })
    })())
}

const SEARCH_COLUMNS: &str = "search_id, task_id, query, status, pages_fetched, useful_fragments, harvest_rate, novelty_score, claims_found, has_primary_source, created_at";

#[async_trait]
impl Store for SqliteStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (task_id, hypothesis, status, created_at, pages_limit, time_limit_s)
             VALUES (?1,?2,?3,?4,?5,?6)",
            rusqlite::params![
                task.task_id.to_string(),
                task.hypothesis,
                enum_to_str(&task.status),
                task.created_at.to_rfc3339(),
                task.budget.pages_limit,
                task.budget.time_limit_s as i64,
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn update_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
                rusqlite::params![enum_to_str(&status), task_id.to_string()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::TaskNotFound { task_id });
        }
        Ok(())
    }

    async fn load_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT task_id, hypothesis, status, created_at, pages_limit, time_limit_s FROM tasks WHERE task_id = ?1")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![task_id.to_string()], row_to_task)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(t)) => Ok(Some(t)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn enqueue_job(&self, job: &Job) -> Result<Option<JobId>, StoreError> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT job_id FROM jobs
                 WHERE task_id = ?1 AND kind = ?2 AND payload_hash = ?3
                   AND state NOT IN (?4, ?5)",
                rusqlite::params![
                    job.task_id.to_string(),
                    enum_to_str(&job.kind),
                    job.payload_hash,
                    enum_to_str(&JobState::Failed),
                    enum_to_str(&JobState::Cancelled),
                ],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if existing.is_some() {
            return Ok(None);
        }
        let sql = format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)");
        conn.execute(
            &sql,
            rusqlite::params![
                job.job_id.to_string(),
                job.task_id.to_string(),
                enum_to_str(&job.kind),
                job.payload.to_string(),
                job.payload_hash,
                priority_to_i64(job.priority),
                enum_to_str(&job.state),
                job.attempts,
                job.created_at.to_rfc3339(),
                job.claim_token,
                job.last_error,
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(Some(job.job_id))
    }

    async fn claim_next_job(&self, worker_id: &str, acceptable_kinds: &[JobKind]) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let kinds: Vec<String> = if acceptable_kinds.is_empty() {
            vec![]
        } else {
            acceptable_kinds.iter().map(enum_to_str).collect()
        };
        let sql = if kinds.is_empty() {
            "SELECT job_id FROM jobs WHERE state = ?1 ORDER BY priority DESC, created_at ASC LIMIT 1".to_string()
        } else {
            let placeholders = kinds.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            format!("SELECT job_id FROM jobs WHERE state = ?1 AND kind IN ({placeholders}) ORDER BY priority DESC, created_at ASC LIMIT 1")
        };
        let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![];
        let queued_str = enum_to_str(&JobState::Queued);
        params.push(&queued_str);
        for k in &kinds {
            params.push(k);
        }
        let candidate: Option<String> = conn
            .query_row(&sql, params.as_slice(), |r| r.get(0))
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let Some(job_id) = candidate else { return Ok(None) };

        let claim_token = format!("{worker_id}:{}", uuid::Uuid::new_v4());
        let rows = conn
            .execute(
                "UPDATE jobs SET state = ?1, claim_token = ?2 WHERE job_id = ?3 AND state = ?4",
                rusqlite::params![enum_to_str(&JobState::Running), claim_token, job_id, enum_to_str(&JobState::Queued)],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            // Lost the race to another worker's CAS; caller retries.
            return Ok(None);
        }

        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![job_id], row_to_job)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(Some(result?))
    }

    async fn complete_job(&self, job_id: JobId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE jobs SET state = ?1, claim_token = NULL WHERE job_id = ?2",
                rusqlite::params![enum_to_str(&JobState::Completed), job_id.to_string()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::JobNotFound { job_id });
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: JobId, error: &str, terminal: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let next_state = if terminal { JobState::Failed } else { JobState::Queued };
        let rows = conn
            .execute(
                "UPDATE jobs SET state = ?1, claim_token = NULL, last_error = ?2,
                 attempts = attempts + 1 WHERE job_id = ?3",
                rusqlite::params![enum_to_str(&next_state), error, job_id.to_string()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::JobNotFound { job_id });
        }
        Ok(())
    }

    async fn park_job_awaiting_auth(&self, job_id: JobId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE jobs SET state = ?1, claim_token = NULL WHERE job_id = ?2",
                rusqlite::params![enum_to_str(&JobState::AwaitingAuth), job_id.to_string()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::JobNotFound { job_id });
        }
        Ok(())
    }

    async fn requeue_jobs_for_domain(&self, domain: &str) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE jobs SET state = ?1 WHERE state = ?2 AND job_id IN
                 (SELECT job_id FROM jobs WHERE payload LIKE ?3)",
                rusqlite::params![
                    enum_to_str(&JobState::Queued),
                    enum_to_str(&JobState::AwaitingAuth),
                    format!("%{domain}%"),
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows as u32)
    }

    async fn cancel_non_terminal_jobs(&self, task_id: TaskId, kinds_excluded: &[JobKind]) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let excluded: Vec<String> = kinds_excluded.iter().map(enum_to_str).collect();
        let placeholders = excluded.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = if excluded.is_empty() {
            "UPDATE jobs SET state = ?1 WHERE task_id = ?2 AND state NOT IN (?3,?4,?5)".to_string()
        } else {
            format!("UPDATE jobs SET state = ?1 WHERE task_id = ?2 AND state NOT IN (?3,?4,?5) AND kind NOT IN ({placeholders})")
        };
        let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![];
        let cancelled = enum_to_str(&JobState::Cancelled);
        let task_str = task_id.to_string();
        let completed = enum_to_str(&JobState::Completed);
        let failed = enum_to_str(&JobState::Failed);
        let already_cancelled = enum_to_str(&JobState::Cancelled);
        params.push(&cancelled);
        params.push(&task_str);
        params.push(&completed);
        params.push(&failed);
        params.push(&already_cancelled);
        for e in &excluded {
            params.push(e);
        }
        let rows = conn
            .execute(&sql, params.as_slice())
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows as u32)
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![job_id.to_string()], row_to_job)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(j)) => Ok(Some(j)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn list_jobs_for_task(&self, task_id: TaskId) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE task_id = ?1 ORDER BY created_at"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![task_id.to_string()], row_to_job)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| StoreError::Sqlite(e.to_string()))??);
        }
        Ok(out)
    }

    async fn upsert_page(&self, page: &Page) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let paper_json = page
            .paper_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            &format!(
                "INSERT INTO pages ({PAGE_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                 ON CONFLICT(url) DO UPDATE SET title=excluded.title, fetched_at=excluded.fetched_at,
                 html_path=excluded.html_path, paper_metadata=excluded.paper_metadata"
            ),
            rusqlite::params![
                page.page_id.to_string(),
                page.url,
                page.domain,
                enum_to_str(&page.domain_category),
                page.title,
                page.fetched_at.to_rfc3339(),
                page.html_path,
                paper_json,
                enum_to_str(&page.page_type),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn insert_fragment(&self, fragment: &Fragment) -> Result<Option<FragmentId>, StoreError> {
        let conn = self.conn.lock().await;
        let hash = content_hash(&fragment.text);
        let existing: Option<String> = conn
            .query_row(
                "SELECT fragment_id FROM fragments WHERE page_id = ?1 AND text_hash = ?2",
                rusqlite::params![fragment.page_id.to_string(), hash],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if existing.is_some() {
            return Ok(None);
        }
        conn.execute(
            &format!("INSERT INTO fragments ({FRAGMENT_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
            rusqlite::params![
                fragment.fragment_id.to_string(),
                fragment.page_id.to_string(),
                enum_to_str(&fragment.fragment_type),
                fragment.text,
                hash,
                fragment.heading_context,
                fragment.is_primary as i64,
                fragment.relevance_reason,
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(Some(fragment.fragment_id))
    }

    async fn insert_claim(&self, claim: &Claim) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO claims ({CLAIM_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
            rusqlite::params![
                claim.claim_id.to_string(),
                claim.task_id.to_string(),
                claim.claim_text,
                claim.confidence,
                claim.uncertainty,
                serde_json::to_string(&claim.source_fragment_ids).map_err(|e| StoreError::Serialization(e.to_string()))?,
                claim.controversy,
                claim.verification_notes,
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn update_claim_scores(&self, claim_id: ClaimId, confidence: f64, uncertainty: f64, controversy: f64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE claims SET confidence = ?1, uncertainty = ?2, controversy = ?3 WHERE claim_id = ?4",
            rusqlite::params![confidence, uncertainty, controversy, claim_id.to_string()],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn update_claim_verification_notes(&self, claim_id: ClaimId, notes: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE claims SET verification_notes = ?1 WHERE claim_id = ?2",
            rusqlite::params![notes, claim_id.to_string()],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<Option<EdgeId>, StoreError> {
        if edge.source_type == edge.target_type && edge.source_id == edge.target_id {
            return Err(StoreError::ReferentialIntegrity(format!("self-loop on {}", edge.source_id)));
        }
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT edge_id FROM edges WHERE source_type=?1 AND source_id=?2 AND target_type=?3 AND target_id=?4 AND relation=?5",
                rusqlite::params![
                    enum_to_str(&edge.source_type),
                    edge.source_id.to_string(),
                    enum_to_str(&edge.target_type),
                    edge.target_id.to_string(),
                    enum_to_str(&edge.relation),
                ],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if existing.is_some() {
            return Ok(None);
        }
        conn.execute(
            &format!("INSERT INTO edges ({EDGE_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)"),
            rusqlite::params![
                edge.edge_id.to_string(),
                enum_to_str(&edge.source_type),
                edge.source_id.to_string(),
                enum_to_str(&edge.target_type),
                edge.target_id.to_string(),
                enum_to_str(&edge.relation),
                edge.nli_edge_confidence,
                edge.is_academic as i64,
                enum_to_str(&edge.source_domain_category),
                enum_to_str(&edge.target_domain_category),
                edge.task_id.to_string(),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(Some(edge.edge_id))
    }

    async fn update_edge_relation(&self, edge_id: EdgeId, relation: crate::types::EdgeRelation) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE edges SET relation = ?1 WHERE edge_id = ?2",
            rusqlite::params![enum_to_str(&relation), edge_id.to_string()],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn get_page(&self, page_id: PageId) -> Result<Option<Page>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {PAGE_COLUMNS} FROM pages WHERE page_id = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt.query_row(rusqlite::params![page_id.to_string()], row_to_page).optional().map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(p)) => Ok(Some(p)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn get_page_by_url(&self, url: &str) -> Result<Option<Page>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {PAGE_COLUMNS} FROM pages WHERE url = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt.query_row(rusqlite::params![url], row_to_page).optional().map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(p)) => Ok(Some(p)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn list_pages_by_domain(&self, domain: &str) -> Result<Vec<Page>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {PAGE_COLUMNS} FROM pages WHERE domain = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![domain], row_to_page)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn update_domain_category(&self, domain: &str, category: crate::types::DomainCategory) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE pages SET domain_category = ?1 WHERE domain = ?2",
                rusqlite::params![enum_to_str(&category), domain],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows as u32)
    }

    async fn record_engine_result(&self, health: &EngineHealth) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO engine_health ({HEALTH_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                 ON CONFLICT(engine) DO UPDATE SET success_rate_1h=excluded.success_rate_1h,
                 success_rate_24h=excluded.success_rate_24h, captcha_rate=excluded.captcha_rate,
                 median_latency_ms=excluded.median_latency_ms, last_used_at=excluded.last_used_at,
                 circuit_state=excluded.circuit_state, consecutive_failures=excluded.consecutive_failures,
                 cooldown_until=excluded.cooldown_until"
            ),
            rusqlite::params![
                health.engine,
                health.success_rate_1h,
                health.success_rate_24h,
                health.captcha_rate,
                health.median_latency_ms,
                health.last_used_at.map(|t| t.to_rfc3339()),
                enum_to_str(&health.circuit_state),
                health.consecutive_failures,
                health.cooldown_until.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn get_engine_health(&self, engine: &str) -> Result<Option<EngineHealth>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {HEALTH_COLUMNS} FROM engine_health WHERE engine = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt.query_row(rusqlite::params![engine], row_to_health).optional().map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(h)) => Ok(Some(h)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn increment_domain_counters(&self, domain: &str, requests: u32, pages: u32) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let today = Utc::now().date_naive().to_string();
        conn.execute(
            "INSERT INTO domain_budgets (domain, date, requests_today, pages_today, max_requests_per_day, max_pages_per_day)
             VALUES (?1,?2,?3,?4, 1000000, 1000000)
             ON CONFLICT(domain, date) DO UPDATE SET requests_today = requests_today + ?3, pages_today = pages_today + ?4",
            rusqlite::params![domain, today, requests, pages],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn get_domain_budget(&self, domain: &str) -> Result<Option<DomainBudget>, StoreError> {
        let conn = self.conn.lock().await;
        let today = Utc::now().date_naive().to_string();
        let mut stmt = conn
            .prepare(&format!("SELECT {BUDGET_COLUMNS} FROM domain_budgets WHERE domain = ?1 AND date = ?2"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![domain, today], row_to_budget)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(b)) => Ok(Some(b)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn set_domain_caps(&self, domain: &str, max_requests_per_day: u32, max_pages_per_day: u32) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let today = Utc::now().date_naive().to_string();
        conn.execute(
            "INSERT INTO domain_budgets (domain, date, requests_today, pages_today, max_requests_per_day, max_pages_per_day)
             VALUES (?1,?2,0,0,?3,?4)
             ON CONFLICT(domain, date) DO UPDATE SET max_requests_per_day = ?3, max_pages_per_day = ?4",
            rusqlite::params![domain, today, max_requests_per_day, max_pages_per_day],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn intervention_enqueue(&self, intervention: &Intervention) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO interventions ({INTERVENTION_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
            rusqlite::params![
                intervention.queue_id.to_string(),
                intervention.task_id.to_string(),
                intervention.url,
                intervention.domain,
                enum_to_str(&intervention.auth_type),
                enum_to_str(&intervention.status),
                intervention.search_job_id.map(|j| j.to_string()),
                intervention.session_data.as_ref().map(|v| v.to_string()),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn intervention_get(&self, queue_id: InterventionId) -> Result<Option<Intervention>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE queue_id = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let result = stmt
            .query_row(rusqlite::params![queue_id.to_string()], row_to_intervention)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        match result {
            Some(Ok(i)) => Ok(Some(i)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn intervention_mark_in_progress(&self, queue_id: InterventionId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE interventions SET status = ?1 WHERE queue_id = ?2",
                rusqlite::params![enum_to_str(&InterventionStatus::InProgress), queue_id.to_string()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::InterventionNotFound { queue_id });
        }
        Ok(())
    }

    async fn intervention_resolve(&self, queue_id: InterventionId, session_data: Option<serde_json::Value>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE interventions SET status = ?1, session_data = COALESCE(?2, session_data) WHERE queue_id = ?3",
                rusqlite::params![enum_to_str(&InterventionStatus::Completed), session_data.map(|v| v.to_string()), queue_id.to_string()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::InterventionNotFound { queue_id });
        }
        Ok(())
    }

    async fn intervention_list_pending(&self, task_id: Option<TaskId>) -> Result<Vec<Intervention>, StoreError> {
        let conn = self.conn.lock().await;
        let pending = enum_to_str(&InterventionStatus::Pending);
        let rows = match task_id {
            Some(tid) => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE status = ?1 AND task_id = ?2"))
                    .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                let rows = stmt
                    .query_map(rusqlite::params![pending, tid.to_string()], row_to_intervention)
                    .map_err(|e| StoreError::Sqlite(e.to_string()))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE status = ?1"))
                    .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                let rows = stmt
                    .query_map(rusqlite::params![pending], row_to_intervention)
                    .map_err(|e| StoreError::Sqlite(e.to_string()))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                rows
            }
        };
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn intervention_capture_session(&self, domain: &str, session_data: serde_json::Value) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE interventions SET session_data = ?1 WHERE domain = ?2 AND status = ?3",
            rusqlite::params![session_data.to_string(), domain, enum_to_str(&InterventionStatus::Completed)],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn intervention_get_session_for_domain(&self, domain: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT session_data FROM interventions WHERE domain = ?1 AND status = ?2 AND session_data IS NOT NULL
                 ORDER BY rowid DESC LIMIT 1",
                rusqlite::params![domain, enum_to_str(&InterventionStatus::Completed)],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        raw.map(|r| serde_json::from_str(&r).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()
    }

    async fn load_evidence_graph(&self, task_id: TaskId) -> Result<EvidenceGraphView, StoreError> {
        let conn = self.conn.lock().await;
        let mut claim_stmt = conn
            .prepare(&format!("SELECT {CLAIM_COLUMNS} FROM claims WHERE task_id = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let claims: Vec<Claim> = claim_stmt
            .query_map(rusqlite::params![task_id.to_string()], row_to_claim)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let mut edge_stmt = conn
            .prepare(&format!("SELECT {EDGE_COLUMNS} FROM edges WHERE task_id = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let edges: Vec<Edge> = edge_stmt
            .query_map(rusqlite::params![task_id.to_string()], row_to_edge)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let fragment_ids: std::collections::HashSet<String> = edges
            .iter()
            .filter(|e| e.source_type == EndpointType::Fragment)
            .map(|e| e.source_id.to_string())
            .collect();
        let mut fragments = Vec::new();
        let mut pages = Vec::new();
        let mut page_ids_seen = std::collections::HashSet::new();
        for fid in fragment_ids {
            let mut stmt = conn
                .prepare(&format!("SELECT {FRAGMENT_COLUMNS} FROM fragments WHERE fragment_id = ?1"))
                .map_err(|e| StoreError::Sqlite(e.to_string()))?;
            if let Some(frag) = stmt
                .query_row(rusqlite::params![fid], row_to_fragment)
                .optional()
                .map_err(|e| StoreError::Sqlite(e.to_string()))?
            {
                let frag = frag?;
                if page_ids_seen.insert(frag.page_id.to_string()) {
                    let mut pstmt = conn
                        .prepare(&format!("SELECT {PAGE_COLUMNS} FROM pages WHERE page_id = ?1"))
                        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                    if let Some(page) = pstmt
                        .query_row(rusqlite::params![frag.page_id.to_string()], row_to_page)
                        .optional()
                        .map_err(|e| StoreError::Sqlite(e.to_string()))?
                    {
                        pages.push(page?);
                    }
                }
                fragments.push(frag);
            }
        }

        Ok(EvidenceGraphView { claims, fragments, pages, edges })
    }

    async fn get_claim_evidence(&self, claim_id: ClaimId) -> Result<Option<ClaimEvidence>, StoreError> {
        let conn = self.conn.lock().await;
        let mut claim_stmt = conn
            .prepare(&format!("SELECT {CLAIM_COLUMNS} FROM claims WHERE claim_id = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let claim = match claim_stmt
            .query_row(rusqlite::params![claim_id.to_string()], row_to_claim)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?
        {
            Some(c) => c?,
            None => return Ok(None),
        };

        let mut edge_stmt = conn
            .prepare(&format!("SELECT {EDGE_COLUMNS} FROM edges WHERE target_type = ?1 AND target_id = ?2"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let edges: Vec<Edge> = edge_stmt
            .query_map(rusqlite::params![enum_to_str(&EndpointType::Claim), claim_id.0.to_string()], row_to_edge)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let mut fragments = Vec::new();
        let mut pages = Vec::new();
        let mut page_ids_seen = std::collections::HashSet::new();
        for edge in edges.iter().filter(|e| e.source_type == EndpointType::Fragment) {
            let mut fstmt = conn
                .prepare(&format!("SELECT {FRAGMENT_COLUMNS} FROM fragments WHERE fragment_id = ?1"))
                .map_err(|e| StoreError::Sqlite(e.to_string()))?;
            if let Some(frag) = fstmt
                .query_row(rusqlite::params![edge.source_id.to_string()], row_to_fragment)
                .optional()
                .map_err(|e| StoreError::Sqlite(e.to_string()))?
            {
                let frag = frag?;
                if page_ids_seen.insert(frag.page_id.to_string()) {
                    let mut pstmt = conn
                        .prepare(&format!("SELECT {PAGE_COLUMNS} FROM pages WHERE page_id = ?1"))
                        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
                    if let Some(page) = pstmt
                        .query_row(rusqlite::params![frag.page_id.to_string()], row_to_page)
                        .optional()
                        .map_err(|e| StoreError::Sqlite(e.to_string()))?
                    {
                        pages.push(page?);
                    }
                }
                fragments.push(frag);
            }
        }

        Ok(Some(ClaimEvidence { claim, edges, fragments, pages }))
    }

    async fn record_search(&self, record: &SearchRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO searches ({SEARCH_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)"),
            rusqlite::params![
                record.search_id,
                record.task_id.to_string(),
                record.query,
                enum_to_str(&record.status),
                record.pages_fetched,
                record.useful_fragments,
                record.harvest_rate,
                record.novelty_score,
                record.claims_found,
                record.has_primary_source as i64,
                record.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn list_searches_for_task(&self, task_id: TaskId) -> Result<Vec<SearchRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {SEARCH_COLUMNS} FROM searches WHERE task_id = ?1 ORDER BY created_at"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![task_id.to_string()], row_to_search)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| StoreError::Sqlite(e.to_string()))??);
        }
        Ok(out)
    }

    async fn append_feedback_audit(&self, action: &str, target_id: &str, payload: &serde_json::Value) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO feedback_audit (action, target_id, payload, recorded_at) VALUES (?1,?2,?3,?4)",
            rusqlite::params![action, target_id, payload.to_string(), Utc::now().to_rfc3339()],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobKind, Priority, TaskBudget};

    fn make_task() -> Task {
        Task {
            task_id: TaskId::new(),
            hypothesis: "coffee causes long life".to_string(),
            status: TaskStatus::Exploring,
            created_at: Utc::now(),
            budget: TaskBudget::default(),
        }
    }

    fn make_job(task_id: TaskId, kind: JobKind, payload: serde_json::Value) -> Job {
        Job {
            job_id: JobId::new(),
            task_id,
            kind,
            payload_hash: payload_hash(&payload),
            payload,
            priority: Priority::Normal,
            state: JobState::Queued,
            attempts: 0,
            created_at: Utc::now(),
            claim_token: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn create_and_load_task() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();
        let loaded = store.load_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.hypothesis, task.hypothesis);
        assert_eq!(loaded.status, TaskStatus::Exploring);
    }

    #[tokio::test]
    async fn enqueue_dedup_on_non_terminal() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();
        let payload = serde_json::json!({"query": "q"});
        let job = make_job(task.task_id, JobKind::Search, payload.clone());
        assert!(store.enqueue_job(&job).await.unwrap().is_some());
        let dup = make_job(task.task_id, JobKind::Search, payload);
        assert!(store.enqueue_job(&dup).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_allowed_after_terminal() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();
        let payload = serde_json::json!({"query": "q"});
        let job = make_job(task.task_id, JobKind::Search, payload.clone());
        store.enqueue_job(&job).await.unwrap();
        store.fail_job(job.job_id, "boom", true).await.unwrap();
        let resubmit = make_job(task.task_id, JobKind::Search, payload);
        assert!(store.enqueue_job(&resubmit).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_next_job_sets_claim_token() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();
        let job = make_job(task.task_id, JobKind::Search, serde_json::json!({"q": 1}));
        store.enqueue_job(&job).await.unwrap();
        let claimed = store.claim_next_job("worker-1", &[]).await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Running);
        assert!(claimed.claim_token.is_some());
        assert!(store.claim_next_job("worker-2", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn crash_safe_restart_resets_incomplete_jobs() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();
        let job = make_job(task.task_id, JobKind::Search, serde_json::json!({"q": 1}));
        store.enqueue_job(&job).await.unwrap();
        store.claim_next_job("worker-1", &[]).await.unwrap();
        let reset = store.reset_incomplete_jobs().await.unwrap();
        assert_eq!(reset, 1);
        let reloaded = store.load_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Failed);
        assert_eq!(reloaded.last_error.as_deref(), Some("server_restart_reset"));
    }

    #[tokio::test]
    async fn fragment_insert_is_idempotent_on_text_hash() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();
        let page = Page {
            page_id: PageId::new(),
            url: "https://example.com/a".to_string(),
            domain: "example.com".to_string(),
            domain_category: crate::types::DomainCategory::General,
            title: "A".to_string(),
            fetched_at: Utc::now(),
            html_path: None,
            paper_metadata: None,
            page_type: crate::types::PageType::Web,
        };
        store.upsert_page(&page).await.unwrap();
        let fragment = Fragment {
            fragment_id: FragmentId::new(),
            page_id: page.page_id,
            fragment_type: crate::types::FragmentType::Paragraph,
            text: "some evidence".to_string(),
            heading_context: None,
            is_primary: true,
            relevance_reason: "directly addresses the hypothesis".to_string(),
        };
        assert!(store.insert_fragment(&fragment).await.unwrap().is_some());
        let dup = Fragment { fragment_id: FragmentId::new(), ..fragment };
        assert!(store.insert_fragment(&dup).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edge_rejects_self_loop() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = make_task();
        store.create_task(&task).await.unwrap();
        let id = uuid::Uuid::new_v4();
        let edge = Edge {
            edge_id: EdgeId::new(),
            source_type: EndpointType::Claim,
            source_id: id,
            target_type: EndpointType::Claim,
            target_id: id,
            relation: crate::types::EdgeRelation::Supports,
            nli_edge_confidence: 0.9,
            is_academic: false,
            source_domain_category: crate::types::DomainCategory::General,
            target_domain_category: crate::types::DomainCategory::General,
            task_id: task.task_id,
        };
        assert!(store.insert_edge(&edge).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_reads_share_connection() {
        let store = std::sync::Arc::new(SqliteStore::open_in_memory().unwrap());
        let task = make_task();
        store.create_task(&task).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let task_id = task.task_id;
            handles.push(tokio::spawn(async move { store.load_task(task_id).await.unwrap() }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_some());
        }
    }
}
