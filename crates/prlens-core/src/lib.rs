//! Core types, configuration, and error handling for prlens.
//!
//! This crate provides the shared foundation used by the other prlens crates:
//! - [`PrLensError`] and [`FetchError`]: error types using `thiserror`
//! - [`PrLensConfig`]: configuration loaded from `.prlens.toml` and the environment
//! - Shared types: [`PrSnapshot`], [`ChangedFile`], [`AnalysisIssue`],
//!   [`AnalysisResult`], [`CacheKey`], [`OutputFormat`]

mod config;
mod error;
mod types;

pub use config::{
    CacheBackend, CacheConfig, GitHubConfig, JobsConfig, LlmConfig, OllamaConfig, OpenAiConfig,
    PrLensConfig,
};
pub use error::{FetchError, PrLensError};
pub use types::{
    AnalysisIssue, AnalysisResult, CacheKey, Category, ChangedFile, FileStatus, OutputFormat,
    PrSnapshot, Severity, NO_SHA,
};

/// A convenience `Result` type for prlens operations.
pub type Result<T> = std::result::Result<T, PrLensError>;
