/// Errors that can occur across the prlens pipeline.
///
/// Library crates use this type directly; the binary crate reports it as a
/// `miette` diagnostic.
///
/// # Examples
///
/// ```
/// use prlens_core::PrLensError;
///
/// let err = PrLensError::Config("missing API key".into());
/// assert!(err.to_string().contains("missing API key"));
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum PrLensError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(help("check .prlens.toml and the PRLENS_* environment variables"))]
    Config(String),

    /// The pull request snapshot could not be fetched.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fetch(#[from] FetchError),

    /// Cache store failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// SQLite failure.
    #[error("database error: {0}")]
    Database(String),

    /// LLM API or response error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Job bookkeeping failure (worker pool shut down, task panicked).
    #[error("job error: {0}")]
    Job(String),

    /// A request was rejected before any work started.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Fatal failures while turning a repository URL and PR number into a snapshot.
///
/// Messages are written for display to the requesting user.
///
/// # Examples
///
/// ```
/// use prlens_core::FetchError;
///
/// let err = FetchError::NotFound { owner: "o".into(), repo: "r".into(), number: 9 };
/// assert_eq!(err.to_string(), "PR #9 doesn't exist in o/r");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum FetchError {
    /// The repository URL is not `<scheme>://<host>/<owner>/<repo>[.git]`.
    #[error("invalid repo_url '{0}'; expected https://github.com/<owner>/<repo>")]
    InvalidRepoUrl(String),

    /// The pull request or repository does not exist (or is invisible to the token).
    #[error("PR #{number} doesn't exist in {owner}/{repo}")]
    NotFound {
        owner: String,
        repo: String,
        number: u64,
    },

    /// The token was rejected.
    #[error("GitHub auth failed, check your token")]
    #[diagnostic(help("set GITHUB_TOKEN or pass --token"))]
    AuthFailed,

    /// Forbidden or rate limited.
    #[error("access denied or rate limited, try using a token")]
    AccessDenied,

    /// The API did not answer within the client timeout.
    #[error("GitHub API timed out, try again later")]
    Timeout,

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Anything else, including unexpected status codes.
    #[error("GitHub API error: {0}")]
    Unknown(String),
}
