//! Lyra's core engine: a crash-safe job scheduler, a unified web/academic
//! retriever, and a Bayesian evidence graph, exposed behind the small
//! protocol in [`protocol`].
//!
//! Modules are layered bottom-up: `types` has no internal dependencies,
//! `store` depends only on `types`, and everything above depends downward
//! but never sideways into a peer it doesn't need.

pub mod concurrency;
pub mod config;
pub mod evidence;
pub mod feedback;
pub mod intervention;
pub mod metrics;
pub mod policy;
pub mod protocol;
pub mod retriever;
pub mod scheduler;
pub mod store;
pub mod traits;
pub mod types;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::protocol::{
        AuthQueueItem, ClaimView, CreateTaskResponse, FeedbackResponse, FragmentView,
        MaterialsResponse, Protocol, QueueTargetsResponse, ResolveAuthResponse, StatusResponse,
        StopTaskResponse,
    };
    pub use crate::scheduler::{JobHandler, JobOutcome, Scheduler, StopScope};
    pub use crate::store::{SqliteStore, Store};
    pub use crate::types::*;
}
