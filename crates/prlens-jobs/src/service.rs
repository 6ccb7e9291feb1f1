//! Request surface: single submissions, bounded batches, polling, health.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use prlens_core::{AnalysisResult, JobsConfig, PrLensConfig, PrLensError};
use prlens_review::github::{parse_repo_url, GitHubFetcher};
use prlens_review::llm::{Provider, ProviderGateway, ReviewProvider};
use prlens_review::pool::WorkerPool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::cache::open_cache;
use crate::orchestrator::{AnalysisRequest, Orchestrator};
use crate::queue::{JobId, JobOutcome, JobQueue, JobStatus};

/// One entry of a batch response.
///
/// # Examples
///
/// ```
/// use prlens_jobs::service::{BatchItem, BatchOutcome};
///
/// let item = BatchItem {
///     repo_url: "https://github.com/o/r".into(),
///     pr_number: 4,
///     outcome: BatchOutcome::Error { error: "GitHub auth failed, check your token".into() },
/// };
/// let json = serde_json::to_value(&item).unwrap();
/// assert_eq!(json["status"], "error");
/// assert_eq!(json["pr_number"], 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Repository URL as submitted.
    pub repo_url: String,
    /// Pull request number as submitted.
    pub pr_number: u64,
    /// Per-item result.
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

/// Success or failure of one batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchOutcome {
    /// The analysis completed.
    Success {
        /// The analysis.
        result: AnalysisResult,
    },
    /// The pull request could not be analyzed.
    Error {
        /// Display text of the failure.
        error: String,
    },
}

/// Response to a batch submission, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Stable digest of the requests and their results.
    pub batch_id: String,
    /// Number of requests in the batch.
    pub total_prs: usize,
    /// One entry per request.
    pub results: Vec<BatchItem>,
}

impl BatchReport {
    /// Number of items that failed.
    pub fn error_count(&self) -> usize {
        self.results
            .iter()
            .filter(|item| matches!(item.outcome, BatchOutcome::Error { .. }))
            .count()
    }
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Every checked dependency answered.
    Ok,
    /// The cache or the selected provider is unusable.
    Degraded,
}

/// Result of [`ReviewService::health`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall state.
    pub status: HealthState,
    /// Per-dependency detail, e.g. `"cache" => "ok (sqlite)"`.
    pub dependencies: BTreeMap<String, String>,
}

/// Entry point for callers: submit, poll, batch, and health.
pub struct ReviewService {
    orchestrator: Arc<Orchestrator>,
    queue: JobQueue,
    batch_limit: usize,
    gateway: Option<Arc<ProviderGateway>>,
}

impl ReviewService {
    /// Wrap an already wired orchestrator.
    pub fn new(orchestrator: Orchestrator, jobs: &JobsConfig) -> Self {
        let orchestrator = Arc::new(orchestrator);
        let queue = JobQueue::new(
            Arc::clone(&orchestrator),
            jobs.max_concurrent_jobs,
            jobs.result_retention_secs,
        );
        Self {
            orchestrator,
            queue,
            batch_limit: jobs.batch_limit.max(1),
            gateway: None,
        }
    }

    /// Build the full pipeline from configuration: GitHub fetcher, the
    /// configured provider, and the configured cache backend.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client or the cache store cannot be created.
    pub fn from_config(config: &PrLensConfig) -> Result<Self, PrLensError> {
        let pool = WorkerPool::new(config.jobs.worker_threads);
        let fetcher = Arc::new(GitHubFetcher::new(&config.github, pool.clone())?);
        let gateway = Arc::new(ProviderGateway::new(&config.llm)?);
        let provider: Arc<dyn ReviewProvider> = Arc::clone(&gateway) as Arc<dyn ReviewProvider>;
        let cache = open_cache(&config.cache)?;
        info!(
            provider = gateway.provider().name(),
            model = gateway.model_name(),
            cache = cache.backend_name(),
            workers = pool.size(),
            "review service ready"
        );

        let orchestrator = Orchestrator::new(fetcher, provider, cache, pool)
            .with_cache_settings(config.cache.namespace.clone(), config.cache.ttl_seconds);
        let mut service = Self::new(orchestrator, &config.jobs);
        service.gateway = Some(gateway);
        Ok(service)
    }

    /// The orchestrator behind this service.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Maximum requests per batch.
    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Queue one analysis and return its job id.
    ///
    /// # Errors
    ///
    /// Rejects a malformed repository URL or a zero PR number before any
    /// network call.
    pub async fn submit(&self, request: AnalysisRequest) -> Result<JobId, PrLensError> {
        validate(&request)?;
        Ok(self.queue.submit(request).await)
    }

    /// Status of a job id. Unparseable ids are [`JobStatus::Unknown`].
    pub async fn status(&self, job_id: &str) -> JobStatus {
        match job_id.parse::<JobId>() {
            Ok(id) => self.queue.status(id).await,
            Err(_) => JobStatus::Unknown,
        }
    }

    /// Result of a job id; never blocks.
    pub async fn result(&self, job_id: &str) -> JobOutcome {
        match job_id.parse::<JobId>() {
            Ok(id) => self.queue.result(id).await,
            Err(_) => JobOutcome::Unknown,
        }
    }

    /// The underlying queue, for callers that poll with [`JobQueue::wait`].
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Analyze up to [`batch_limit`](Self::batch_limit) pull requests concurrently.
    ///
    /// Items fail individually; the batch itself only fails when it is too large.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::InvalidRequest`] if the batch exceeds the limit.
    pub async fn submit_batch(
        &self,
        requests: Vec<AnalysisRequest>,
    ) -> Result<BatchReport, PrLensError> {
        if requests.len() > self.batch_limit {
            return Err(PrLensError::InvalidRequest(format!(
                "maximum {} PRs per batch, got {}",
                self.batch_limit,
                requests.len()
            )));
        }
        info!(count = requests.len(), "batch submitted");

        let orchestrator = &self.orchestrator;
        let results: Vec<BatchItem> = stream::iter(requests.iter())
            .map(|request| async move {
                let outcome = match validate(request) {
                    Ok(()) => orchestrator.run(request, None).await,
                    Err(e) => Err(e),
                };
                let outcome = match outcome {
                    Ok(result) => BatchOutcome::Success { result },
                    Err(e) => {
                        warn!(repo = %request.repo_url, pr = request.pr_number, error = %e, "batch item failed");
                        BatchOutcome::Error {
                            error: e.to_string(),
                        }
                    }
                };
                BatchItem {
                    repo_url: request.repo_url.clone(),
                    pr_number: request.pr_number,
                    outcome,
                }
            })
            .buffered(self.batch_limit)
            .collect()
            .await;

        Ok(BatchReport {
            batch_id: batch_id(&requests, &results),
            total_prs: requests.len(),
            results,
        })
    }

    /// Probe the cache and the LLM backends.
    pub async fn health(&self) -> HealthReport {
        let mut dependencies = BTreeMap::new();
        let mut degraded = false;

        let cache = self.orchestrator.cache();
        let probe = self.orchestrator.cache_key("health-probe", 0, None);
        let cache_state = match cache.set_with_ttl(&probe, b"ok".to_vec(), 60).await {
            Ok(()) => match cache.get(&probe).await {
                Ok(Some(value)) if value == b"ok" => format!("ok ({})", cache.backend_name()),
                Ok(_) => "error: probe value not read back".to_string(),
                Err(e) => format!("error: {e}"),
            },
            Err(e) => format!("error: {e}"),
        };
        degraded |= cache_state.starts_with("error");
        dependencies.insert("cache".to_string(), cache_state);

        match &self.gateway {
            Some(gateway) => {
                let selected = gateway.provider();
                let ollama = match gateway.list_local_models().await {
                    Ok(models) => format!("ok ({} models)", models.len()),
                    Err(e) => {
                        degraded |= selected == Provider::LocalInference;
                        format!("error: {e}")
                    }
                };
                dependencies.insert("ollama".to_string(), ollama);

                let openai = if gateway.remote_configured() {
                    "configured".to_string()
                } else {
                    degraded |= selected == Provider::RemoteCommercial;
                    "not configured".to_string()
                };
                dependencies.insert("openai".to_string(), openai);
                dependencies.insert(
                    "provider".to_string(),
                    format!("{} ({})", selected.name(), gateway.model_name()),
                );
            }
            None => {
                dependencies.insert("provider".to_string(), "not checked".to_string());
            }
        }

        HealthReport {
            status: if degraded {
                HealthState::Degraded
            } else {
                HealthState::Ok
            },
            dependencies,
        }
    }
}

fn validate(request: &AnalysisRequest) -> Result<(), PrLensError> {
    if request.pr_number == 0 {
        return Err(PrLensError::InvalidRequest(
            "pr_number must be a positive integer".into(),
        ));
    }
    parse_repo_url(&request.repo_url)?;
    Ok(())
}

/// `batch_<count>_<first 16 hex digits of SHA-256>` over the requests and results.
fn batch_id(requests: &[AnalysisRequest], results: &[BatchItem]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(requests.len().to_le_bytes());
    hasher.update(serde_json::to_vec(requests).unwrap_or_default());
    hasher.update(serde_json::to_vec(results).unwrap_or_default());
    let digest = format!("{:x}", hasher.finalize());
    format!("batch_{}_{}", requests.len(), &digest[..16])
}
