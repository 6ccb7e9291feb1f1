use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prlens_core::{
    CacheKey, Category, ChangedFile, FetchError, FileStatus, JobsConfig, PrLensError, PrSnapshot,
    Severity,
};
use prlens_jobs::{
    AnalysisRequest, BatchOutcome, CacheStore, HealthState, JobOutcome, JobQueue, JobStage,
    JobStatus, MemoryCache, Orchestrator, ReviewService,
};
use prlens_review::github::SnapshotFetcher;
use prlens_review::heuristic::HEURISTIC_SUMMARY;
use prlens_review::llm::{ProviderError, ProviderOutcome, ProviderReply, ReviewProvider};
use prlens_review::pool::WorkerPool;
use prlens_review::prompt::ReviewMessages;
use tokio::sync::mpsc;

const REPO: &str = "https://github.com/acme/shop";
const HEAD: &str = "abc123";
const FENCED_REPLY: &str = "Here is my review.\n```json\n{\"summary\":\"Looks fine\",\"issues\":[{\"file_path\":\"app.py\",\"line\":1,\"severity\":\"warning\",\"category\":\"bug\",\"message\":\"Leaks env\"}]}\n```";

struct FakeFetcher {
    failures: HashMap<u64, FetchError>,
    calls: AtomicUsize,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeFetcher {
    fn new() -> Self {
        Self {
            failures: HashMap::new(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Each fetch holds for `delay`, so overlapping fetches are observable.
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn failing(pr_number: u64, error: FetchError) -> Self {
        let mut fetcher = Self::new();
        fetcher.failures.insert(pr_number, error);
        fetcher
    }
}

#[async_trait]
impl SnapshotFetcher for FakeFetcher {
    async fn fetch(
        &self,
        _repo_url: &str,
        pr_number: u64,
        _token: Option<&str>,
    ) -> Result<PrSnapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.failures.get(&pr_number) {
            return Err(err.clone());
        }
        Ok(PrSnapshot {
            owner: "acme".into(),
            repo: "shop".into(),
            number: pr_number,
            title: "Add checkout".into(),
            body: None,
            head_sha: HEAD.into(),
            base_sha: "base".into(),
            files: vec![ChangedFile {
                path: "app.py".into(),
                status: FileStatus::Modified,
                additions: 1,
                deletions: 0,
                changes: 1,
                patch: Some("+print(\"debug\")".into()),
                raw_url: None,
            }],
            diff: String::new(),
        })
    }
}

struct FakeProvider {
    reply: Result<String, ProviderError>,
    calls: AtomicUsize,
}

impl FakeProvider {
    fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(error: ProviderError) -> Self {
        Self {
            reply: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReviewProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn model(&self) -> &str {
        "fake-1"
    }

    async fn invoke(&self, messages: &ReviewMessages) -> ProviderOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(messages.user().contains("acme/shop"));
        self.reply.clone().map(|text| ProviderReply {
            provider: "fake".into(),
            model: "fake-1".into(),
            text,
        })
    }
}

/// A cache whose writes always fail.
struct BrokenCache;

#[async_trait]
impl CacheStore for BrokenCache {
    fn backend_name(&self) -> &'static str {
        "broken"
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>, PrLensError> {
        Ok(None)
    }

    async fn set_with_ttl(
        &self,
        _key: &CacheKey,
        _value: Vec<u8>,
        _ttl_secs: u64,
    ) -> Result<(), PrLensError> {
        Err(PrLensError::Cache("disk full".into()))
    }
}

fn orchestrator(
    fetcher: Arc<FakeFetcher>,
    provider: Arc<FakeProvider>,
    cache: Arc<dyn CacheStore>,
) -> Orchestrator {
    Orchestrator::new(fetcher, provider, cache, WorkerPool::new(2))
}

async fn run_collecting(
    orch: &Orchestrator,
    request: &AnalysisRequest,
) -> (Result<prlens_core::AnalysisResult, PrLensError>, Vec<JobStage>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<JobStage>();
    let result = orch.run(request, Some(&tx)).await;
    drop(tx);
    let mut stages = Vec::new();
    while let Some(stage) = rx.recv().await {
        stages.push(stage);
    }
    (result, stages)
}

#[tokio::test]
async fn fresh_run_parses_provider_reply_and_caches_it() {
    let provider = Arc::new(FakeProvider::replying(FENCED_REPLY));
    let cache = Arc::new(MemoryCache::new());
    let orch = orchestrator(Arc::new(FakeFetcher::new()), provider.clone(), cache.clone());

    let (result, stages) = run_collecting(&orch, &AnalysisRequest::new(REPO, 7)).await;
    let result = result.unwrap();

    assert_eq!(
        stages,
        [
            JobStage::Fetching,
            JobStage::Reviewing,
            JobStage::Parsing,
            JobStage::Caching,
            JobStage::Done
        ]
    );
    assert_eq!(result.summary, "Looks fine");
    assert_eq!(result.head_sha.as_deref(), Some(HEAD));
    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].severity, Severity::Warning);
    assert_eq!(result.issues[0].category, Category::Bug);
    assert_eq!(result.model_info["provider"], "fake");
    assert_eq!(result.model_info["model"], "fake-1");
    assert_eq!(result.model_info["parse_tier"], "fenced");
    assert!(!result.is_degraded());

    let key = CacheKey::new("prreview", REPO, 7, Some(HEAD));
    let stored = cache.get(&key).await.unwrap().expect("result cached");
    let cached: prlens_core::AnalysisResult = serde_json::from_slice(&stored).unwrap();
    assert_eq!(cached, result);
}

#[tokio::test]
async fn second_run_returns_cached_result_without_reviewing() {
    let fetcher = Arc::new(FakeFetcher::new());
    let provider = Arc::new(FakeProvider::replying(FENCED_REPLY));
    let orch = orchestrator(fetcher.clone(), provider.clone(), Arc::new(MemoryCache::new()));
    let request = AnalysisRequest::new(REPO, 7);

    let first = orch.run(&request, None).await.unwrap();
    assert_eq!(provider.calls(), 1);

    let (second, stages) = run_collecting(&orch, &request).await;
    assert_eq!(second.unwrap(), first);
    assert_eq!(provider.calls(), 1, "provider must not run on a cache hit");
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(stages, [JobStage::Fetching, JobStage::CacheHit, JobStage::Done]);
}

#[tokio::test]
async fn forced_run_skips_the_cache() {
    let provider = Arc::new(FakeProvider::replying(FENCED_REPLY));
    let orch = orchestrator(
        Arc::new(FakeFetcher::new()),
        provider.clone(),
        Arc::new(MemoryCache::new()),
    );
    let mut request = AnalysisRequest::new(REPO, 7);
    orch.run(&request, None).await.unwrap();

    request.force = true;
    orch.run(&request, None).await.unwrap();
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn connection_failure_falls_back_to_heuristic_scan() {
    let provider = Arc::new(FakeProvider::failing(ProviderError::ConnectionFailure(
        "Connection refused".into(),
    )));
    let orch = orchestrator(
        Arc::new(FakeFetcher::new()),
        provider.clone(),
        Arc::new(MemoryCache::new()),
    );

    let (result, stages) = run_collecting(&orch, &AnalysisRequest::new(REPO, 3)).await;
    let result = result.unwrap();

    assert_eq!(
        stages,
        [
            JobStage::Fetching,
            JobStage::Reviewing,
            JobStage::Caching,
            JobStage::Done
        ]
    );
    assert!(!result.summary.is_empty());
    assert_eq!(result.summary, HEURISTIC_SUMMARY);
    assert!(result.is_degraded());
    assert_eq!(result.model_info["fallback"], "heuristic");
    assert_eq!(result.model_info["provider"], "heuristic");
    assert_eq!(result.model_info["requested_provider"], "fake");
    assert_eq!(result.model_info["error_kind"], "connection_failure");

    // The added print() line is the only finding.
    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].severity, Severity::Warning);
    assert_eq!(result.issues[0].category, Category::BestPractice);
}

#[tokio::test]
async fn prose_reply_is_marked_degraded() {
    let provider = Arc::new(FakeProvider::replying(
        "Mostly fine.\nFile: app.py\nLine: 1\nSeverity: warning\nMessage: stray print",
    ));
    let orch = orchestrator(
        Arc::new(FakeFetcher::new()),
        provider,
        Arc::new(MemoryCache::new()),
    );
    let result = orch.run(&AnalysisRequest::new(REPO, 1), None).await.unwrap();
    assert!(result.is_degraded());
    assert_eq!(result.model_info["parse_tier"], "line_heuristic");
    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].message, "stray print");
    assert_eq!(result.issues[0].category, Category::BestPractice);
}

#[tokio::test]
async fn fetch_failure_fails_the_job_and_caches_nothing() {
    let fetcher = Arc::new(FakeFetcher::failing(
        99,
        FetchError::NotFound {
            owner: "acme".into(),
            repo: "shop".into(),
            number: 99,
        },
    ));
    let provider = Arc::new(FakeProvider::replying(FENCED_REPLY));
    let cache = Arc::new(MemoryCache::new());
    let orch = orchestrator(fetcher, provider.clone(), cache.clone());

    let (result, stages) = run_collecting(&orch, &AnalysisRequest::new(REPO, 99)).await;
    let err = result.unwrap_err();
    assert!(matches!(err, PrLensError::Fetch(FetchError::NotFound { .. })));
    assert_eq!(err.to_string(), "PR #99 doesn't exist in acme/shop");
    assert_eq!(stages, [JobStage::Fetching, JobStage::Failed]);
    assert_eq!(provider.calls(), 0);

    for sha in [Some(HEAD), None] {
        let key = CacheKey::new("prreview", REPO, 99, sha);
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }
}

#[tokio::test]
async fn cache_write_failure_still_completes() {
    let orch = orchestrator(
        Arc::new(FakeFetcher::new()),
        Arc::new(FakeProvider::replying(FENCED_REPLY)),
        Arc::new(BrokenCache),
    );
    let result = orch.run(&AnalysisRequest::new(REPO, 7), None).await.unwrap();
    assert_eq!(result.summary, "Looks fine");
}

#[tokio::test]
async fn unreadable_cache_entry_is_recomputed() {
    let provider = Arc::new(FakeProvider::replying(FENCED_REPLY));
    let cache = Arc::new(MemoryCache::new());
    let key = CacheKey::new("prreview", REPO, 7, Some(HEAD));
    cache
        .set_with_ttl(&key, b"not json".to_vec(), 60)
        .await
        .unwrap();

    let orch = orchestrator(Arc::new(FakeFetcher::new()), provider.clone(), cache);
    let result = orch.run(&AnalysisRequest::new(REPO, 7), None).await.unwrap();
    assert_eq!(provider.calls(), 1);
    assert_eq!(result.summary, "Looks fine");
}

#[tokio::test]
async fn custom_namespace_changes_the_key() {
    let cache = Arc::new(MemoryCache::new());
    let orch = orchestrator(
        Arc::new(FakeFetcher::new()),
        Arc::new(FakeProvider::replying(FENCED_REPLY)),
        cache.clone(),
    )
    .with_cache_settings("staging", 120);
    orch.run(&AnalysisRequest::new(REPO, 7), None).await.unwrap();

    let key = CacheKey::new("staging", REPO, 7, Some(HEAD));
    assert!(cache.get(&key).await.unwrap().is_some());
    assert_eq!(orch.cache_key(REPO, 7, Some(HEAD)), key);
}

#[tokio::test]
async fn oversized_ttl_does_not_fail_the_job() {
    let cache = Arc::new(MemoryCache::new());
    let orch = orchestrator(
        Arc::new(FakeFetcher::new()),
        Arc::new(FakeProvider::failing(ProviderError::ConnectionFailure(
            "Connection refused".into(),
        ))),
        cache.clone(),
    )
    .with_cache_settings("prreview", u64::MAX);
    let queue = JobQueue::new(Arc::new(orch), 1, 3600);

    let id = queue.submit(AnalysisRequest::new(REPO, 7)).await;
    match wait(&queue, id).await {
        JobOutcome::Ready(result) => assert_eq!(result.summary, HEURISTIC_SUMMARY),
        other => panic!("unexpected outcome {other:?}"),
    }
    let key = CacheKey::new("prreview", REPO, 7, Some(HEAD));
    assert!(cache.get(&key).await.unwrap().is_some());
}

async fn wait(queue: &JobQueue, id: prlens_jobs::JobId) -> JobOutcome {
    tokio::time::timeout(
        Duration::from_secs(5),
        queue.wait(id, Duration::from_millis(10)),
    )
    .await
    .expect("job finished in time")
}

#[tokio::test]
async fn queue_reports_done_and_failed_jobs() {
    let fetcher = Arc::new(FakeFetcher::failing(404, FetchError::AuthFailed));
    let orch = orchestrator(
        fetcher,
        Arc::new(FakeProvider::replying(FENCED_REPLY)),
        Arc::new(MemoryCache::new()),
    );
    let queue = JobQueue::new(Arc::new(orch), 2, 3600);

    let ok = queue.submit(AnalysisRequest::new(REPO, 1)).await;
    let bad = queue.submit(AnalysisRequest::new(REPO, 404)).await;

    match wait(&queue, ok).await {
        JobOutcome::Ready(result) => assert_eq!(result.summary, "Looks fine"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(queue.status(ok).await, JobStatus::Done);

    assert_eq!(
        wait(&queue, bad).await,
        JobOutcome::Failed("GitHub auth failed, check your token".into())
    );
    assert_eq!(
        queue.status(bad).await,
        JobStatus::Failed {
            error: "GitHub auth failed, check your token".into()
        }
    );

    assert_eq!(
        queue.status(prlens_jobs::JobId::new()).await,
        JobStatus::Unknown
    );
    assert_eq!(queue.tracked().await, 2);
}

#[tokio::test]
async fn finished_jobs_expire_after_retention() {
    let orch = orchestrator(
        Arc::new(FakeFetcher::new()),
        Arc::new(FakeProvider::replying(FENCED_REPLY)),
        Arc::new(MemoryCache::new()),
    );
    let queue = JobQueue::new(Arc::new(orch), 1, 0);

    let id = queue.submit(AnalysisRequest::new(REPO, 1)).await;
    assert_eq!(wait(&queue, id).await, JobOutcome::Unknown);
    assert_eq!(queue.status(id).await, JobStatus::Unknown);
    assert_eq!(queue.prune().await, 1);
    assert_eq!(queue.tracked().await, 0);
}

#[tokio::test]
async fn queue_never_runs_more_than_the_concurrency_cap() {
    let fetcher = Arc::new(FakeFetcher::slow(Duration::from_millis(50)));
    let orch = orchestrator(
        fetcher.clone(),
        Arc::new(FakeProvider::replying(FENCED_REPLY)),
        Arc::new(MemoryCache::new()),
    );
    let queue = JobQueue::new(Arc::new(orch), 2, 3600);

    let mut ids = Vec::new();
    for n in 1..=6 {
        ids.push(queue.submit(AnalysisRequest::new(REPO, n)).await);
    }
    for id in ids {
        assert!(matches!(wait(&queue, id).await, JobOutcome::Ready(_)));
    }
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 6);
    assert_eq!(fetcher.peak(), 2);
}

fn service(fetcher: FakeFetcher, provider: FakeProvider, batch_limit: usize) -> ReviewService {
    service_with(Arc::new(fetcher), provider, batch_limit)
}

fn service_with(
    fetcher: Arc<FakeFetcher>,
    provider: FakeProvider,
    batch_limit: usize,
) -> ReviewService {
    let orch = orchestrator(
        fetcher,
        Arc::new(provider),
        Arc::new(MemoryCache::new()),
    );
    let jobs = JobsConfig {
        batch_limit,
        ..JobsConfig::default()
    };
    ReviewService::new(orch, &jobs)
}

#[tokio::test]
async fn oversized_batch_is_rejected() {
    let svc = service(
        FakeFetcher::new(),
        FakeProvider::replying(FENCED_REPLY),
        10,
    );
    let requests = (1..=11).map(|n| AnalysisRequest::new(REPO, n)).collect();
    let err = svc.submit_batch(requests).await.unwrap_err();
    assert!(matches!(err, PrLensError::InvalidRequest(_)));
}

#[tokio::test]
async fn batch_collects_per_item_failures_in_order() {
    let svc = service(
        FakeFetcher::failing(2, FetchError::Timeout),
        FakeProvider::replying(FENCED_REPLY),
        10,
    );
    let report = svc
        .submit_batch(vec![
            AnalysisRequest::new(REPO, 1),
            AnalysisRequest::new(REPO, 2),
            AnalysisRequest::new("https://github.com/acme", 3),
        ])
        .await
        .unwrap();

    assert_eq!(report.total_prs, 3);
    assert_eq!(report.error_count(), 2);
    assert!(report.batch_id.starts_with("batch_3_"));

    let numbers: Vec<_> = report.results.iter().map(|i| i.pr_number).collect();
    assert_eq!(numbers, [1, 2, 3]);
    assert!(matches!(report.results[0].outcome, BatchOutcome::Success { .. }));
    match &report.results[1].outcome {
        BatchOutcome::Error { error } => assert_eq!(error, "GitHub API timed out, try again later"),
        other => panic!("unexpected outcome {other:?}"),
    }
    match &report.results[2].outcome {
        BatchOutcome::Error { error } => assert!(error.contains("invalid repo_url")),
        other => panic!("unexpected outcome {other:?}"),
    }

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["results"][0]["status"], "success");
    assert_eq!(json["results"][1]["status"], "error");
}

#[tokio::test]
async fn batch_items_are_fetched_concurrently() {
    let fetcher = Arc::new(FakeFetcher::slow(Duration::from_millis(100)));
    let svc = service_with(fetcher.clone(), FakeProvider::replying(FENCED_REPLY), 10);

    let requests = (1..=5).map(|n| AnalysisRequest::new(REPO, n)).collect();
    let report = svc.submit_batch(requests).await.unwrap();

    assert_eq!(report.error_count(), 0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);
    assert!(fetcher.peak() > 1, "batch items ran one at a time");
}

#[tokio::test]
async fn batch_at_the_limit_runs_every_item_at_once() {
    let fetcher = Arc::new(FakeFetcher::slow(Duration::from_millis(30)));
    let svc = service_with(fetcher.clone(), FakeProvider::replying(FENCED_REPLY), 2);

    let requests = (1..=2).map(|n| AnalysisRequest::new(REPO, n)).collect();
    svc.submit_batch(requests).await.unwrap();
    assert_eq!(fetcher.peak(), 2);

    let requests = (1..=3).map(|n| AnalysisRequest::new(REPO, n)).collect();
    assert!(svc.submit_batch(requests).await.is_err());
}

#[tokio::test]
async fn service_rejects_malformed_submissions_and_polls_by_string_id() {
    let svc = service(
        FakeFetcher::new(),
        FakeProvider::replying(FENCED_REPLY),
        10,
    );
    assert!(matches!(
        svc.submit(AnalysisRequest::new("not a repo", 1)).await,
        Err(PrLensError::Fetch(FetchError::InvalidRepoUrl(_)))
    ));
    assert_eq!(svc.status("garbage").await, JobStatus::Unknown);
    assert_eq!(svc.result("garbage").await, JobOutcome::Unknown);

    let id = svc.submit(AnalysisRequest::new(REPO, 5)).await.unwrap();
    let outcome = wait(svc.queue(), id).await;
    assert!(matches!(outcome, JobOutcome::Ready(_)));
    assert_eq!(svc.status(&id.to_string()).await, JobStatus::Done);
}

#[tokio::test]
async fn health_checks_the_cache_round_trip() {
    let svc = service(
        FakeFetcher::new(),
        FakeProvider::replying(FENCED_REPLY),
        10,
    );
    let report = svc.health().await;
    assert_eq!(report.status, HealthState::Ok);
    assert_eq!(report.dependencies["cache"], "ok (memory)");
    assert_eq!(report.dependencies["provider"], "not checked");
}
