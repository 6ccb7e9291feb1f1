//! Job execution for prlens.
//!
//! The [`orchestrator`] runs one analysis through fetch, cache lookup, review,
//! parse, and cache write. The [`queue`] runs orchestrations in the background
//! with pollable status, and [`service`] is the request surface on top,
//! including bounded batches and health checks.

pub mod cache;
pub mod orchestrator;
pub mod queue;
pub mod service;

pub use cache::{open_cache, CacheStore, MemoryCache, SqliteCache};
pub use orchestrator::{AnalysisRequest, JobStage, Orchestrator};
pub use queue::{JobId, JobOutcome, JobQueue, JobStatus};
pub use service::{BatchItem, BatchOutcome, BatchReport, HealthReport, HealthState, ReviewService};
