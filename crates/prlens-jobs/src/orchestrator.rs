//! The per-job state machine.
//!
//! ```text
//! SUBMITTED -> FETCHING -> CACHE_HIT -> DONE
//!                       \-> REVIEWING -> PARSING -> CACHING -> DONE
//!                       \-> FAILED
//! ```
//!
//! Only a fetch failure ends in `FAILED`. Provider failures fall back to the
//! heuristic analyzer, parse irregularities degrade inside the parser, and
//! cache failures are logged and ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use prlens_core::{AnalysisIssue, AnalysisResult, CacheKey, PrLensError, PrSnapshot};
use prlens_review::coerce::coerce_issues;
use prlens_review::github::SnapshotFetcher;
use prlens_review::heuristic;
use prlens_review::llm::{ProviderError, ReviewProvider};
use prlens_review::parser::{parse_response, ParseTier};
use prlens_review::pool::WorkerPool;
use prlens_review::prompt::build_review_messages;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;

/// Default cache key prefix.
pub const DEFAULT_NAMESPACE: &str = "prreview";

/// Default cache entry lifetime, in seconds.
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Observable stage of a job.
///
/// # Examples
///
/// ```
/// use prlens_jobs::orchestrator::JobStage;
///
/// assert_eq!(JobStage::CacheHit.to_string(), "CACHE_HIT");
/// assert!(JobStage::Failed.is_terminal());
/// assert!(!JobStage::Reviewing.is_terminal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    /// Accepted, not yet started.
    Submitted,
    /// Reading the pull request from source control.
    Fetching,
    /// A cached result was found.
    CacheHit,
    /// Building the prompt and waiting on the provider (or heuristic fallback).
    Reviewing,
    /// Parsing provider text.
    Parsing,
    /// Writing the result to the cache.
    Caching,
    /// Finished with a result.
    Done,
    /// Finished without a result.
    Failed,
}

impl JobStage {
    /// `true` for `Done` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStage::Done | JobStage::Failed)
    }

    /// Upper snake case name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Submitted => "SUBMITTED",
            JobStage::Fetching => "FETCHING",
            JobStage::CacheHit => "CACHE_HIT",
            JobStage::Reviewing => "REVIEWING",
            JobStage::Parsing => "PARSING",
            JobStage::Caching => "CACHING",
            JobStage::Done => "DONE",
            JobStage::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to analyze one pull request.
///
/// The token is accepted on input but never serialized back out.
///
/// # Examples
///
/// ```
/// use prlens_jobs::orchestrator::AnalysisRequest;
///
/// let req: AnalysisRequest = serde_json::from_str(
///     r#"{"repo_url":"https://github.com/o/r","pr_number":3,"github_token":"t"}"#,
/// ).unwrap();
/// assert_eq!(req.token.as_deref(), Some("t"));
/// assert!(!req.force);
/// assert!(!serde_json::to_string(&req).unwrap().contains("\"t\""));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Repository URL, e.g. `https://github.com/owner/repo`.
    pub repo_url: String,
    /// Pull request number.
    pub pr_number: u64,
    /// Source-control token for this request.
    #[serde(default, alias = "github_token", skip_serializing)]
    pub token: Option<String>,
    /// Skip the cache lookup and recompute.
    #[serde(default)]
    pub force: bool,
}

impl AnalysisRequest {
    /// A request with no token that honours the cache.
    pub fn new(repo_url: impl Into<String>, pr_number: u64) -> Self {
        Self {
            repo_url: repo_url.into(),
            pr_number,
            token: None,
            force: false,
        }
    }
}

/// Drives one job from fetch to cached result.
pub struct Orchestrator {
    fetcher: Arc<dyn SnapshotFetcher>,
    provider: Arc<dyn ReviewProvider>,
    cache: Arc<dyn CacheStore>,
    pool: WorkerPool,
    namespace: String,
    ttl_secs: u64,
}

impl Orchestrator {
    /// Wire the pipeline with the default cache namespace and TTL.
    pub fn new(
        fetcher: Arc<dyn SnapshotFetcher>,
        provider: Arc<dyn ReviewProvider>,
        cache: Arc<dyn CacheStore>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            fetcher,
            provider,
            cache,
            pool,
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }

    /// Override the cache key prefix and entry lifetime.
    pub fn with_cache_settings(mut self, namespace: impl Into<String>, ttl_secs: u64) -> Self {
        self.namespace = namespace.into();
        self.ttl_secs = ttl_secs;
        self
    }

    /// The cache store results are written to.
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Cache key for a request at a given head commit.
    pub fn cache_key(&self, repo_url: &str, pr_number: u64, head_sha: Option<&str>) -> CacheKey {
        CacheKey::new(&self.namespace, repo_url.trim(), pr_number, head_sha)
    }

    /// Run one job to completion.
    ///
    /// Stage transitions are sent to `events` when given.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Fetch`] if the snapshot cannot be fetched. Every
    /// later failure is absorbed into a degraded result.
    pub async fn run(
        &self,
        request: &AnalysisRequest,
        events: Option<&UnboundedSender<JobStage>>,
    ) -> Result<AnalysisResult, PrLensError> {
        let emit = |stage: JobStage| {
            debug!(repo = %request.repo_url, pr = request.pr_number, stage = %stage, "job stage");
            if let Some(tx) = events {
                let _ = tx.send(stage);
            }
        };

        emit(JobStage::Fetching);
        let snapshot = match self
            .fetcher
            .fetch(&request.repo_url, request.pr_number, request.token.as_deref())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(repo = %request.repo_url, pr = request.pr_number, error = %e, "failed to fetch pull request");
                emit(JobStage::Failed);
                return Err(e.into());
            }
        };

        let key = self.cache_key(&request.repo_url, request.pr_number, snapshot.head());
        if request.force {
            info!(key = %key, "forced run, skipping cache lookup");
        } else if let Some(cached) = self.lookup(&key).await {
            emit(JobStage::CacheHit);
            emit(JobStage::Done);
            return Ok(cached);
        }

        emit(JobStage::Reviewing);
        let snapshot = Arc::new(snapshot);
        let prompt_source = Arc::clone(&snapshot);
        let messages = self
            .offload(move || build_review_messages(&prompt_source))
            .await;
        let outcome = self.provider.invoke(&messages).await;

        let (summary, issues, model_info) = match outcome {
            Ok(reply) => {
                emit(JobStage::Parsing);
                let text = reply.text;
                let (tier, summary, issues) = self
                    .offload(move || {
                        let parsed = parse_response(&text);
                        (parsed.tier, parsed.summary, coerce_issues(&parsed.issues))
                    })
                    .await;
                info!(provider = %reply.provider, tier = tier.name(), issues = issues.len(), "provider review parsed");

                let mut model_info = BTreeMap::new();
                model_info.insert("provider".to_string(), Value::from(reply.provider));
                model_info.insert("model".to_string(), Value::from(reply.model));
                model_info.insert("parse_tier".to_string(), Value::from(tier.name()));
                if tier == ParseTier::LineHeuristic {
                    model_info.insert("fallback".to_string(), Value::from(tier.name()));
                }
                (summary, issues, model_info)
            }
            Err(e) => self.heuristic_fallback(&snapshot, &e),
        };

        let result = AnalysisResult {
            repo_url: request.repo_url.trim().to_string(),
            pr_number: request.pr_number,
            head_sha: snapshot.head().map(String::from),
            issues,
            summary,
            model_info,
        };

        emit(JobStage::Caching);
        self.store(&key, &result).await;
        emit(JobStage::Done);
        info!(repo = %result.repo_url, pr = result.pr_number, issues = result.issues.len(), degraded = result.is_degraded(), "analysis complete");
        Ok(result)
    }

    async fn lookup(&self, key: &CacheKey) -> Option<AnalysisResult> {
        match self.cache.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<AnalysisResult>(&bytes) {
                Ok(result) => {
                    info!(key = %key, "cache hit");
                    Some(result)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "ignoring unreadable cache entry");
                    None
                }
            },
            Ok(None) => {
                info!(key = %key, "cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache lookup failed, recomputing");
                None
            }
        }
    }

    async fn store(&self, key: &CacheKey, result: &AnalysisResult) {
        let bytes = match serde_json::to_vec(result) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "couldn't serialize result for cache");
                return;
            }
        };
        match self.cache.set_with_ttl(key, bytes, self.ttl_secs).await {
            Ok(()) => debug!(key = %key, ttl = self.ttl_secs, "result cached"),
            Err(e) => warn!(key = %key, error = %e, "couldn't cache result"),
        }
    }

    fn heuristic_fallback(
        &self,
        snapshot: &PrSnapshot,
        cause: &ProviderError,
    ) -> (String, Vec<AnalysisIssue>, BTreeMap<String, Value>) {
        warn!(provider = self.provider.name(), kind = cause.kind(), error = %cause, "provider unavailable, using heuristic scan");
        let report = heuristic::analyze(snapshot);

        let mut model_info = BTreeMap::new();
        model_info.insert("provider".to_string(), Value::from("heuristic"));
        model_info.insert("fallback".to_string(), Value::from("heuristic"));
        model_info.insert(
            "requested_provider".to_string(),
            Value::from(self.provider.name()),
        );
        model_info.insert("model".to_string(), Value::from(self.provider.model()));
        model_info.insert("error".to_string(), Value::from(cause.to_string()));
        model_info.insert("error_kind".to_string(), Value::from(cause.kind()));
        (report.summary, report.issues, model_info)
    }

    /// Run CPU-bound work on the pool, or inline if the pool is unavailable.
    async fn offload<F, T>(&self, task: F) -> T
    where
        F: FnOnce() -> T + Clone + Send + 'static,
        T: Send + 'static,
    {
        match self.pool.run(task.clone()).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "worker pool unavailable, running inline");
                task()
            }
        }
    }
}
