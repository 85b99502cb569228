//! Periodic metrics snapshots of the scheduler, retriever, and store.
//! Mirrors the donor's file-exporter shape (atomic write via a temp file
//! and rename) without its OTLP backend, since Lyra runs local-first and
//! has nowhere to ship OTLP spans to by default.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics export failed: {0}")]
    ExportFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_export_interval")]
    pub export_interval_seconds: u64,
    pub path: PathBuf,
    #[serde(default = "default_pretty_print")]
    pub pretty_print: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_export_interval() -> u64 {
    60
}

fn default_pretty_print() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            export_interval_seconds: 60,
            path: std::env::temp_dir().join("lyra_metrics.json"),
            pretty_print: true,
        }
    }
}

/// Point-in-time counters pulled from the scheduler, store, and policy
/// engine. Counters are monotonic since process start; rates are derived
/// by the consumer from successive snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_awaiting_auth: u64,
    pub pages_fetched: u64,
    pub fragments_persisted: u64,
    pub claims_recomputed: u64,
    pub captcha_hits: u64,
    pub interventions_pending: u64,
}

/// Monotonic counters updated in-process by the scheduler and retriever.
/// A snapshot is a cheap `Ordering::Relaxed` load of each counter; nothing
/// here blocks the hot path.
#[derive(Default)]
pub struct MetricsRegistry {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_awaiting_auth: AtomicU64,
    pages_fetched: AtomicU64,
    fragments_persisted: AtomicU64,
    claims_recomputed: AtomicU64,
    captcha_hits: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_awaiting_auth(&self) {
        self.jobs_awaiting_auth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_fetched(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fragment_persisted(&self) {
        self.fragments_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claim_recomputed(&self) {
        self.claims_recomputed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_captcha_hit(&self) {
        self.captcha_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, interventions_pending: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: chrono::Utc::now().timestamp() as u64,
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_awaiting_auth: self.jobs_awaiting_auth.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            fragments_persisted: self.fragments_persisted.load(Ordering::Relaxed),
            claims_recomputed: self.claims_recomputed.load(Ordering::Relaxed),
            captcha_hits: self.captcha_hits.load(Ordering::Relaxed),
            interventions_pending,
        }
    }
}

#[async_trait]
pub trait MetricsExporter: Send + Sync {
    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), MetricsError>;
}

/// Writes JSON snapshots atomically via a temp file + rename, so a
/// monitoring tool tailing the file never reads a half-written snapshot.
pub struct FileMetrics {
    path: PathBuf,
    pretty_print: bool,
}

impl FileMetrics {
    pub fn new(config: &MetricsConfig) -> Result<Self, MetricsError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path: config.path.clone(), pretty_print: config.pretty_print })
    }
}

#[async_trait]
impl MetricsExporter for FileMetrics {
    async fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), MetricsError> {
        let json = if self.pretty_print { serde_json::to_string_pretty(snapshot)? } else { serde_json::to_string(snapshot)? };
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), MetricsError> {
            use std::io::Write;
            let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(json.as_bytes())?;
            tmp.flush()?;
            tmp.persist(&path).map_err(|e| MetricsError::ExportFailed(format!("failed to persist metrics file {}: {e}", path.display())))?;
            Ok(())
        })
        .await
        .map_err(|e| MetricsError::ExportFailed(format!("blocking task panicked: {e}")))??;

        tracing::debug!(path = %self.path.display(), "metrics snapshot written");
        Ok(())
    }
}

/// Runs `MetricsExporter::export` on `config.export_interval_seconds`,
/// stopping once `shutdown` is notified. Grounded on the scheduler's own
/// `tokio::select!` worker-loop shape so the export loop shuts down
/// cooperatively alongside the job workers.
pub async fn export_loop(registry: Arc<MetricsRegistry>, exporter: Arc<dyn MetricsExporter>, interventions_pending: impl Fn() -> u64 + Send + Sync + 'static, interval_seconds: u64, shutdown: Arc<tokio::sync::Notify>) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let snapshot = registry.snapshot(interventions_pending());
                if let Err(e) = exporter.export(&snapshot).await {
                    tracing::warn!(error = %e, "metrics export failed");
                }
            }
            _ = shutdown.notified() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let registry = MetricsRegistry::new();
        registry.record_job_completed();
        registry.record_job_completed();
        registry.record_captcha_hit();

        let snapshot = registry.snapshot(3);
        assert_eq!(snapshot.jobs_completed, 2);
        assert_eq!(snapshot.captcha_hits, 1);
        assert_eq!(snapshot.interventions_pending, 3);
    }

    #[tokio::test]
    async fn file_exporter_writes_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = MetricsConfig { path: dir.path().join("metrics.json"), ..MetricsConfig::default() };
        let exporter = FileMetrics::new(&config).unwrap();

        let registry = MetricsRegistry::new();
        registry.record_page_fetched();
        let snapshot = registry.snapshot(0);
        exporter.export(&snapshot).await.unwrap();

        let raw = std::fs::read_to_string(&config.path).unwrap();
        let parsed: MetricsSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.pages_fetched, 1);
    }
}
