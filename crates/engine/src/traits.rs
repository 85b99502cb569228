//! The three external collaborators the engine depends on but does not
//! implement: fetching pages, calling ML models, and querying academic
//! APIs. Concrete backends live outside this crate; tests use the mocks
//! at the bottom of this file, following the donor's pattern of defining
//! the seam as an `async_trait` and keeping a lightweight in-memory
//! double alongside it for unit tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AuthType, RetrieverError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Http,
    Browser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub status: u16,
    pub html: Option<String>,
    pub text: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub captcha_kind: Option<AuthType>,
}

impl FetchResult {
    pub fn is_captcha(&self) -> bool {
        self.captcha_kind.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    pub cookies: Vec<Cookie>,
    pub conditional_headers: HashMap<String, String>,
}

/// Fetches a URL over HTTP or a headful browser context, and captures the
/// authenticated session for a domain after a human completes an
/// intervention.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, mode: FetchMode, headers: &HashMap<String, String>) -> Result<FetchResult, RetrieverError>;
    async fn capture_session(&self, domain: &str) -> Result<SessionData, RetrieverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NliLabel {
    Supports,
    Refutes,
    Neutral,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NliResult {
    pub label: NliLabel,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedClaim {
    pub text: String,
}

/// Model inference collaborator: claim extraction, natural-language
/// inference, embeddings, and reranking. Backed by a local model, a
/// hosted API, or a mock, depending on deployment.
#[async_trait]
pub trait MlClient: Send + Sync {
    async fn extract_claims(&self, passages: &[String], hypothesis: &str) -> Result<Vec<ExtractedClaim>, RetrieverError>;
    async fn nli(&self, premise: &str, hypothesis: &str) -> Result<NliResult, RetrieverError>;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrieverError>;
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f64>, RetrieverError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Paper {
    pub paper_id: String,
    pub doi: Option<String>,
    pub pmid: Option<String>,
    pub arxiv_id: Option<String>,
    pub crid: Option<String>,
    pub title: String,
    pub abstract_text: Option<String>,
    pub venue: Option<String>,
    pub year: Option<u32>,
    pub citation_count: Option<u32>,
    pub is_open_access: Option<bool>,
    pub url: Option<String>,
}

/// One configured academic API client (Semantic Scholar, Crossref,
/// arXiv, ...). `PolicyEngine`/`ConcurrencyController` gate calls; this
/// trait only describes the wire operations.
#[async_trait]
pub trait AcademicApi: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str, limit: u32) -> Result<Vec<Paper>, RetrieverError>;
    async fn get_paper_by_doi(&self, doi: &str) -> Result<Option<Paper>, RetrieverError>;
    async fn get_references(&self, paper_id: &str) -> Result<Vec<Paper>, RetrieverError>;
}

/// Stand-ins for the external collaborators the demo CLI has no live
/// backend for. Every call fails fast with a descriptive error instead of
/// attempting real network or model I/O, so `queue_targets` still
/// exercises the scheduler end-to-end without pretending to browse the web.
pub mod unconfigured {
    use super::*;

    pub struct UnconfiguredFetcher;

    #[async_trait]
    impl Fetcher for UnconfiguredFetcher {
        async fn fetch(&self, url: &str, _mode: FetchMode, _headers: &HashMap<String, String>) -> Result<FetchResult, RetrieverError> {
            Err(RetrieverError::FetchFailed(format!("no fetcher backend configured, cannot fetch {url}")))
        }

        async fn capture_session(&self, domain: &str) -> Result<SessionData, RetrieverError> {
            Err(RetrieverError::FetchFailed(format!("no fetcher backend configured, cannot capture session for {domain}")))
        }
    }

    pub struct UnconfiguredMlClient;

    #[async_trait]
    impl MlClient for UnconfiguredMlClient {
        async fn extract_claims(&self, _passages: &[String], _hypothesis: &str) -> Result<Vec<ExtractedClaim>, RetrieverError> {
            Err(RetrieverError::FetchFailed("no ML backend configured".into()))
        }

        async fn nli(&self, _premise: &str, _hypothesis: &str) -> Result<NliResult, RetrieverError> {
            Err(RetrieverError::FetchFailed("no ML backend configured".into()))
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, RetrieverError> {
            Err(RetrieverError::FetchFailed("no ML backend configured".into()))
        }

        async fn rerank(&self, _query: &str, _texts: &[String]) -> Result<Vec<f64>, RetrieverError> {
            Err(RetrieverError::FetchFailed("no ML backend configured".into()))
        }
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use dashmap::DashMap;

    #[derive(Default)]
    pub struct MockFetcher {
        pub responses: DashMap<String, FetchResult>,
    }

    impl MockFetcher {
        pub fn with_page(self, url: &str, html: &str) -> Self {
            self.responses.insert(
                url.to_string(),
                FetchResult {
                    status: 200,
                    html: Some(html.to_string()),
                    text: None,
                    etag: None,
                    last_modified: None,
                    captcha_kind: None,
                },
            );
            self
        }

        pub fn with_captcha(self, url: &str, kind: AuthType) -> Self {
            self.responses.insert(
                url.to_string(),
                FetchResult {
                    status: 200,
                    html: None,
                    text: None,
                    etag: None,
                    last_modified: None,
                    captcha_kind: Some(kind),
                },
            );
            self
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, url: &str, _mode: FetchMode, _headers: &HashMap<String, String>) -> Result<FetchResult, RetrieverError> {
            self.responses
                .get(url)
                .map(|r| r.clone())
                .ok_or_else(|| RetrieverError::FetchFailed(format!("no mock response for {url}")))
        }

        async fn capture_session(&self, _domain: &str) -> Result<SessionData, RetrieverError> {
            Ok(SessionData::default())
        }
    }

    #[derive(Default)]
    pub struct MockMlClient {
        pub nli_label: Option<NliLabel>,
        pub nli_confidence: f64,
    }

    #[async_trait]
    impl MlClient for MockMlClient {
        async fn extract_claims(&self, passages: &[String], _hypothesis: &str) -> Result<Vec<ExtractedClaim>, RetrieverError> {
            Ok(passages.iter().map(|p| ExtractedClaim { text: p.clone() }).collect())
        }

        async fn nli(&self, _premise: &str, _hypothesis: &str) -> Result<NliResult, RetrieverError> {
            Ok(NliResult {
                label: self.nli_label.unwrap_or(NliLabel::Neutral),
                confidence: self.nli_confidence,
            })
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrieverError> {
            Ok(texts.iter().map(|_| vec![0.0_f32; 8]).collect())
        }

        async fn rerank(&self, _query: &str, texts: &[String]) -> Result<Vec<f64>, RetrieverError> {
            Ok(texts.iter().map(|_| 0.5).collect())
        }
    }

    #[derive(Default)]
    pub struct MockAcademicApi {
        pub name: String,
        pub papers: Vec<Paper>,
    }

    #[async_trait]
    impl AcademicApi for MockAcademicApi {
        fn name(&self) -> &str {
            &self.name
        }

        async fn search(&self, _query: &str, limit: u32) -> Result<Vec<Paper>, RetrieverError> {
            Ok(self.papers.iter().take(limit as usize).cloned().collect())
        }

        async fn get_paper_by_doi(&self, doi: &str) -> Result<Option<Paper>, RetrieverError> {
            Ok(self.papers.iter().find(|p| p.doi.as_deref() == Some(doi)).cloned())
        }

        async fn get_references(&self, _paper_id: &str) -> Result<Vec<Paper>, RetrieverError> {
            Ok(Vec::new())
        }
    }
}
