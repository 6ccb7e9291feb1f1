//! In-process job queue with pollable status and result retrieval.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prlens_core::AnalysisResult;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{error, info};
use uuid::Uuid;

use crate::orchestrator::{AnalysisRequest, JobStage, Orchestrator};

/// Retention is capped at roughly a century.
const MAX_RETENTION_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Opaque job identifier.
///
/// # Examples
///
/// ```
/// use prlens_jobs::queue::JobId;
///
/// let id = JobId::new();
/// let parsed: JobId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// assert!("not-a-job".parse::<JobId>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Externally visible job status.
///
/// # Examples
///
/// ```
/// use prlens_jobs::orchestrator::JobStage;
/// use prlens_jobs::queue::JobStatus;
///
/// let status = JobStatus::Processing { stage: JobStage::Reviewing };
/// let json = serde_json::to_value(&status).unwrap();
/// assert_eq!(json["status"], "PROCESSING");
/// assert_eq!(json["stage"], "REVIEWING");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a free slot.
    Pending,
    /// Running; `stage` is the latest stage reached.
    Processing {
        /// Current stage.
        stage: JobStage,
    },
    /// Finished with a result.
    Done,
    /// Finished with an error message.
    Failed {
        /// Display text of the fatal error.
        error: String,
    },
    /// Never submitted, or pruned after the retention window.
    Unknown,
}

impl JobStatus {
    /// `true` once the job will not change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed { .. } | JobStatus::Unknown
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Processing { stage } => write!(f, "PROCESSING ({stage})"),
            JobStatus::Done => write!(f, "DONE"),
            JobStatus::Failed { error } => write!(f, "FAILED: {error}"),
            JobStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Result lookup outcome. Never blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The job has not finished yet.
    NotReady,
    /// The job finished with a result.
    Ready(AnalysisResult),
    /// The job failed; the message is suitable for display.
    Failed(String),
    /// No such job.
    Unknown,
}

#[derive(Debug)]
struct JobRecord {
    status: JobStatus,
    result: Option<AnalysisResult>,
    finished_at: Option<DateTime<Utc>>,
}

/// Runs submitted jobs in the background, at most `max_concurrent` at once.
///
/// Cloning is cheap; clones share the same job table.
#[derive(Clone)]
pub struct JobQueue {
    orchestrator: Arc<Orchestrator>,
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
    slots: Arc<Semaphore>,
    retention: chrono::Duration,
}

impl JobQueue {
    /// Create a queue over `orchestrator`.
    pub fn new(orchestrator: Arc<Orchestrator>, max_concurrent: usize, retention_secs: u64) -> Self {
        let retention_secs = i64::try_from(retention_secs)
            .unwrap_or(MAX_RETENTION_SECS)
            .min(MAX_RETENTION_SECS);
        Self {
            orchestrator,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retention: chrono::Duration::seconds(retention_secs),
        }
    }

    /// Accept a job and return its id immediately.
    pub async fn submit(&self, request: AnalysisRequest) -> JobId {
        self.prune().await;

        let id = JobId::new();
        self.jobs.write().await.insert(
            id,
            JobRecord {
                status: JobStatus::Pending,
                result: None,
                finished_at: None,
            },
        );
        info!(job = %id, repo = %request.repo_url, pr = request.pr_number, force = request.force, "job submitted");

        let queue = self.clone();
        tokio::spawn(async move { queue.execute(id, request).await });
        id
    }

    /// Current status of `id`.
    pub async fn status(&self, id: JobId) -> JobStatus {
        let jobs = self.jobs.read().await;
        match jobs.get(&id) {
            Some(record) if !self.expired(record, Utc::now()) => record.status.clone(),
            _ => JobStatus::Unknown,
        }
    }

    /// Result of `id` if finished.
    pub async fn result(&self, id: JobId) -> JobOutcome {
        let jobs = self.jobs.read().await;
        let Some(record) = jobs.get(&id).filter(|r| !self.expired(r, Utc::now())) else {
            return JobOutcome::Unknown;
        };
        match (&record.status, &record.result) {
            (JobStatus::Done, Some(result)) => JobOutcome::Ready(result.clone()),
            (JobStatus::Failed { error }, _) => JobOutcome::Failed(error.clone()),
            _ => JobOutcome::NotReady,
        }
    }

    /// Poll every `interval` until the job leaves the queue's non-terminal states.
    pub async fn wait(&self, id: JobId, interval: Duration) -> JobOutcome {
        loop {
            match self.result(id).await {
                JobOutcome::NotReady => tokio::time::sleep(interval).await,
                outcome => return outcome,
            }
        }
    }

    /// Number of records currently held, including expired ones not yet pruned.
    pub async fn tracked(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Drop finished records older than the retention window.
    pub async fn prune(&self) -> usize {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, record| !self.expired(record, now));
        before - jobs.len()
    }

    fn expired(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        record
            .finished_at
            .is_some_and(|at| now.signed_duration_since(at) >= self.retention)
    }

    async fn execute(&self, id: JobId, request: AnalysisRequest) {
        let Ok(_slot) = Arc::clone(&self.slots).acquire_owned().await else {
            self.finish(id, Err("job queue is closed".into())).await;
            return;
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<JobStage>();
        let jobs = Arc::clone(&self.jobs);
        let relay = tokio::spawn(async move {
            while let Some(stage) = rx.recv().await {
                if stage.is_terminal() {
                    continue;
                }
                if let Some(record) = jobs.write().await.get_mut(&id) {
                    record.status = JobStatus::Processing { stage };
                }
            }
        });

        let orchestrator = Arc::clone(&self.orchestrator);
        let run = tokio::spawn(async move { orchestrator.run(&request, Some(&tx)).await });
        let outcome = match run.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("job task failed: {e}")),
        };
        // The sender is gone once the run task ends, so the relay drains and exits.
        let _ = relay.await;
        self.finish(id, outcome).await;
    }

    async fn finish(&self, id: JobId, outcome: Result<AnalysisResult, String>) {
        let mut jobs = self.jobs.write().await;
        let Some(record) = jobs.get_mut(&id) else {
            return;
        };
        match outcome {
            Ok(result) => {
                info!(job = %id, "job done");
                record.status = JobStatus::Done;
                record.result = Some(result);
            }
            Err(message) => {
                error!(job = %id, error = %message, "job failed");
                record.status = JobStatus::Failed { error: message };
            }
        }
        record.finished_at = Some(Utc::now());
    }
}
