//! Error taxonomy for the engine. One enum per subsystem, aggregated into
//! `LyraError`. Kinds map onto the retry / surfacing rules described for
//! each job outcome, not onto Rust type boundaries alone.

use thiserror::Error;

use super::ids::{EdgeId, InterventionId, JobId, TaskId};

#[derive(Error, Debug, Clone)]
pub enum LyraError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error("retriever error: {0}")]
    Retriever(#[from] RetrieverError),

    #[error("evidence graph error: {0}")]
    Evidence(#[from] EvidenceError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("intervention error: {0}")]
    Intervention(#[from] InterventionError),

    #[error("feedback error: {0}")]
    Feedback(#[from] FeedbackError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    #[error("intervention not found: {queue_id}")]
    InterventionNotFound { queue_id: InterventionId },

    #[error("edge referential integrity violated: {0}")]
    ReferentialIntegrity(String),

    #[error("job {job_id} is running without a claim token")]
    MissingClaimToken { job_id: JobId },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

#[derive(Error, Debug, Clone)]
pub enum PolicyError {
    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    #[error("unknown domain: {0}")]
    UnknownDomain(String),

    #[error("circuit open for engine {engine}, cooldown remaining {remaining_s}s")]
    CircuitOpen { engine: String, remaining_s: u64 },

    #[error("no engine available for category {0}")]
    NoEngineAvailable(String),
}

#[derive(Error, Debug, Clone)]
pub enum ConcurrencyError {
    #[error("resource pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("acquisition timed out after {0:?}")]
    AcquireTimeout(std::time::Duration),

    #[error("task cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone)]
pub enum RetrieverError {
    #[error("query analysis failed: {0}")]
    QueryAnalysisFailed(String),

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("identifier resolution failed: {0}")]
    IdentifierResolutionFailed(String),

    #[error("auth required for domain {domain}: {auth_type:?}")]
    AuthRequired {
        domain: String,
        auth_type: super::entities::AuthType,
    },
}

#[derive(Error, Debug, Clone)]
pub enum EvidenceError {
    #[error("claim not found: {0}")]
    ClaimNotFound(String),

    #[error("edge invariant violated: {0}")]
    InvariantViolated(String),

    #[error("self-loop rejected for {0}")]
    SelfLoop(String),
}

#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: super::entities::JobState,
        to: super::entities::JobState,
    },

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),
}

#[derive(Error, Debug, Clone)]
pub enum InterventionError {
    #[error("intervention not found: {queue_id}")]
    NotFound { queue_id: InterventionId },

    #[error("session capture failed: {0}")]
    SessionCaptureFailed(String),
}

#[derive(Error, Debug, Clone)]
pub enum FeedbackError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("target not found: {0}")]
    TargetNotFound(EdgeId),

    #[error("recompute failed: {0}")]
    RecomputeFailed(String),
}

#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

/// Error kinds from spec §7, used to drive retry/surfacing policy
/// independent of the concrete Rust error type that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    AuthRequired,
    BudgetExceeded,
    PolicyDenied,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::TransientNetwork | ErrorKind::RateLimited)
    }
}

pub type LyraResult<T> = Result<T, LyraError>;
