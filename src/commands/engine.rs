//! Wires a [`Protocol`] out of the on-disk config and store, the way
//! `up::run` wires the donor runtime out of its own config file.

use std::sync::Arc;

use lyra_engine::concurrency::ConcurrencyController;
use lyra_engine::config::Config;
use lyra_engine::intervention::InterventionQueue;
use lyra_engine::metrics::MetricsRegistry;
use lyra_engine::policy::PolicyEngine;
use lyra_engine::protocol::Protocol;
use lyra_engine::retriever::Retriever;
use lyra_engine::scheduler::{JobHandler, Scheduler};
use lyra_engine::store::{SqliteStore, Store};
use lyra_engine::traits::unconfigured::{UnconfiguredFetcher, UnconfiguredMlClient};
use lyra_engine::types::JobKind;

/// Builds a [`Protocol`] backed by the SQLite store named in `config`.
///
/// The demo binary never implements a live fetcher or ML backend (those
/// are external collaborators by design): jobs enqueue and persist
/// normally, but a worker that reaches them fails fast with a clear
/// "not configured" error rather than attempting real network I/O.
pub fn build(config: Config) -> anyhow::Result<(Arc<Protocol>, Arc<Scheduler>)> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.store.path)?);
    let policy = Arc::new(PolicyEngine::new(store.clone(), config.clone()));
    let concurrency = Arc::new(ConcurrencyController::new(&config.concurrency));
    let fetcher = Arc::new(UnconfiguredFetcher);
    let ml = Arc::new(UnconfiguredMlClient);
    let retriever = Arc::new(Retriever::new(store.clone(), policy, concurrency, fetcher.clone(), ml, Vec::new(), config.clone()));

    let mut handlers: std::collections::HashMap<JobKind, Arc<dyn JobHandler>> = std::collections::HashMap::new();
    for kind in [JobKind::Search, JobKind::IngestDoi, JobKind::IngestUrl, JobKind::CitationGraph, JobKind::VerifyNli] {
        handlers.insert(kind, retriever.clone());
    }
    let scheduler = Scheduler::new(store.clone(), handlers, config.concurrency.num_workers as usize);

    let interventions = InterventionQueue::new(store.clone(), fetcher);
    let metrics = MetricsRegistry::new();
    let protocol = Arc::new(Protocol::new(store, scheduler.clone(), interventions, metrics));
    Ok((protocol, scheduler))
}

pub fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Ok(Config::load(p)?),
        None => Ok(Config::default()),
    }
}
