use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PrLensError;

/// Top-level configuration loaded from `.prlens.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
///
/// # Examples
///
/// ```
/// use prlens_core::PrLensConfig;
///
/// let config = PrLensConfig::default();
/// assert_eq!(config.llm.provider, "ollama");
/// assert_eq!(config.cache.ttl_seconds, 3600);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrLensConfig {
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Source-control API settings.
    #[serde(default)]
    pub github: GitHubConfig,
    /// Result cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Job execution settings.
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Default log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for PrLensConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            github: GitHubConfig::default(),
            cache: CacheConfig::default(),
            jobs: JobsConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl PrLensConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Io`] if the file cannot be read, or
    /// [`PrLensError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use prlens_core::PrLensConfig;
    /// use std::path::Path;
    ///
    /// let config = PrLensConfig::from_file(Path::new(".prlens.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, PrLensError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use prlens_core::PrLensConfig;
    ///
    /// let toml = r#"
    /// [llm]
    /// provider = "openai"
    /// "#;
    /// let config = PrLensConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.llm.provider, "openai");
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, PrLensError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Config`] if a numeric variable does not parse.
    pub fn apply_env(&mut self) -> Result<(), PrLensError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    ///
    /// Empty values are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Config`] if a numeric variable does not parse.
    ///
    /// # Examples
    ///
    /// ```
    /// use prlens_core::PrLensConfig;
    ///
    /// let mut config = PrLensConfig::default();
    /// config
    ///     .apply_env_from(|key| (key == "PRLENS_MODEL_PROVIDER").then(|| "openai".to_string()))
    ///     .unwrap();
    /// assert_eq!(config.llm.provider, "openai");
    /// ```
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), PrLensError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PRLENS_MODEL_PROVIDER") {
            self.llm.provider = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.llm.openai.api_key = Some(v);
        }
        if let Some(v) = get("PRLENS_OLLAMA_MODEL") {
            self.llm.ollama.model = v;
        }
        if let Some(v) = get("PRLENS_OLLAMA_URL") {
            self.llm.ollama.base_url = v;
        }
        if let Some(v) = get("GITHUB_TOKEN").or_else(|| get("GH_TOKEN")) {
            self.github.token = Some(v);
        }
        if let Some(v) = get("PRLENS_CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = v.trim().parse().map_err(|_| {
                PrLensError::Config(format!("PRLENS_CACHE_TTL_SECONDS is not a number: {v}"))
            })?;
        }
        if let Some(v) = get("PRLENS_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }
}

/// LLM provider configuration.
///
/// # Examples
///
/// ```
/// use prlens_core::LlmConfig;
///
/// let config = LlmConfig::default();
/// assert_eq!(config.ollama.model, "llama3");
/// assert_eq!(config.openai.model, "gpt-4o-mini");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `"ollama"` for local inference or `"openai"` for the remote provider.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Per-call HTTP timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Local inference backend.
    #[serde(default)]
    pub ollama: OllamaConfig,
    /// Remote commercial backend.
    #[serde(default)]
    pub openai: OpenAiConfig,
}

fn default_provider() -> String {
    "ollama".into()
}

fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            timeout_secs: default_llm_timeout(),
            ollama: OllamaConfig::default(),
            openai: OpenAiConfig::default(),
        }
    }
}

/// Local inference (Ollama) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Server base URL. An empty string disables the backend.
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    /// Model tag to chat with.
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

fn default_ollama_url() -> String {
    "http://localhost:11434".into()
}

fn default_ollama_model() -> String {
    "llama3".into()
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model: default_ollama_model(),
        }
    }
}

/// Remote commercial (OpenAI-compatible) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// API key; the backend reports itself unavailable without one.
    pub api_key: Option<String>,
    /// API base URL.
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    /// Model identifier.
    #[serde(default = "default_openai_model")]
    pub model: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_openai_url() -> String {
    "https://api.openai.com".into()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".into()
}

fn default_temperature() -> f32 {
    0.2
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_url(),
            model: default_openai_model(),
            temperature: default_temperature(),
        }
    }
}

/// Source-control API configuration.
///
/// # Examples
///
/// ```
/// use prlens_core::GitHubConfig;
///
/// let config = GitHubConfig::default();
/// assert_eq!(config.timeout_secs, 30);
/// assert!(config.token.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// Token used when a request carries none.
    pub token: Option<String>,
    /// REST API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Per-call HTTP timeout in seconds.
    #[serde(default = "default_github_timeout")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.github.com".into()
}

fn default_github_timeout() -> u64 {
    30
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_api_base(),
            timeout_secs: default_github_timeout(),
        }
    }
}

/// Where cached results live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process-local map; lost on exit.
    #[default]
    Memory,
    /// SQLite file shared by every process pointing at the same path.
    Sqlite,
}

/// Result cache configuration.
///
/// # Examples
///
/// ```
/// use prlens_core::{CacheBackend, CacheConfig};
///
/// let config = CacheConfig::default();
/// assert_eq!(config.backend, CacheBackend::Memory);
/// assert_eq!(config.namespace, "prreview");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Storage backend.
    #[serde(default)]
    pub backend: CacheBackend,
    /// Database path for the SQLite backend.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    /// Entry lifetime in seconds.
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    /// Key prefix.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".prlens/cache.db")
}

fn default_ttl() -> u64 {
    3600
}

fn default_namespace() -> String {
    "prreview".into()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            path: default_cache_path(),
            ttl_seconds: default_ttl(),
            namespace: default_namespace(),
        }
    }
}

/// Job execution configuration.
///
/// # Examples
///
/// ```
/// use prlens_core::JobsConfig;
///
/// let config = JobsConfig::default();
/// assert_eq!(config.worker_threads, 4);
/// assert_eq!(config.batch_limit, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Size of the CPU worker pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Jobs allowed to run at once; further submissions wait in `Pending`.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Maximum requests per batch, also the batch fan-out width.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// How long finished job records stay retrievable, in seconds.
    #[serde(default = "default_retention")]
    pub result_retention_secs: u64,
}

fn default_worker_threads() -> usize {
    4
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_batch_limit() -> usize {
    10
}

fn default_retention() -> u64 {
    60 * 60 * 24
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            batch_limit: default_batch_limit(),
            result_retention_secs: default_retention(),
        }
    }
}
