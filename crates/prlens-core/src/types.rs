use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sentinel used in cache keys when a snapshot carries no head commit.
pub const NO_SHA: &str = "no-sha";

/// Change status of a file in a pull request.
///
/// # Examples
///
/// ```
/// use prlens_core::FileStatus;
///
/// let s: FileStatus = serde_json::from_str("\"renamed\"").unwrap();
/// assert_eq!(s, FileStatus::Renamed);
/// assert_eq!(s.to_string(), "renamed");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// File created by the pull request.
    Added,
    /// Existing file edited in place.
    Modified,
    /// File deleted by the pull request.
    Removed,
    /// File moved, possibly with edits.
    Renamed,
    /// File copied from another path.
    Copied,
    /// Mode or metadata change only.
    Changed,
    /// Listed but untouched.
    Unchanged,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Added => write!(f, "added"),
            FileStatus::Modified => write!(f, "modified"),
            FileStatus::Removed => write!(f, "removed"),
            FileStatus::Renamed => write!(f, "renamed"),
            FileStatus::Copied => write!(f, "copied"),
            FileStatus::Changed => write!(f, "changed"),
            FileStatus::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// One file touched by a pull request.
///
/// `changes == additions + deletions` is expected but not enforced; upstream
/// counts are carried as-is.
///
/// # Examples
///
/// ```
/// use prlens_core::{ChangedFile, FileStatus};
///
/// let file = ChangedFile {
///     path: "src/lib.rs".into(),
///     status: FileStatus::Modified,
///     additions: 3,
///     deletions: 1,
///     changes: 4,
///     patch: Some("+fn new() {}".into()),
///     raw_url: None,
/// };
/// assert_eq!(file.additions + file.deletions, file.changes);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    /// Path relative to the repository root.
    pub path: String,
    /// Kind of change.
    pub status: FileStatus,
    /// Number of added lines.
    pub additions: u64,
    /// Number of deleted lines.
    pub deletions: u64,
    /// Total changed lines as reported upstream.
    pub changes: u64,
    /// Unified-diff patch text, absent for binary or oversized files.
    pub patch: Option<String>,
    /// URL of the raw file content at the head commit.
    pub raw_url: Option<String>,
}

/// Immutable view of a pull request at a specific head commit.
///
/// # Examples
///
/// ```
/// use prlens_core::PrSnapshot;
///
/// let snapshot = PrSnapshot {
///     owner: "octocat".into(),
///     repo: "hello-world".into(),
///     number: 7,
///     title: "Add greeting".into(),
///     body: None,
///     head_sha: "abc123".into(),
///     base_sha: "def456".into(),
///     files: vec![],
///     diff: String::new(),
/// };
/// assert_eq!(snapshot.slug(), "octocat/hello-world");
/// assert_eq!(snapshot.total_additions(), 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrSnapshot {
    /// Repository owner (user or organization).
    pub owner: String,
    /// Repository name without `.git`.
    pub repo: String,
    /// Pull request number.
    pub number: u64,
    /// Pull request title.
    pub title: String,
    /// Pull request description.
    pub body: Option<String>,
    /// Head commit id.
    pub head_sha: String,
    /// Base commit id.
    pub base_sha: String,
    /// Changed files in upstream order.
    pub files: Vec<ChangedFile>,
    /// Full unified diff.
    pub diff: String,
}

impl PrSnapshot {
    /// `owner/repo`.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Sum of added lines across all files.
    pub fn total_additions(&self) -> u64 {
        self.files.iter().map(|f| f.additions).sum()
    }

    /// Sum of deleted lines across all files.
    pub fn total_deletions(&self) -> u64 {
        self.files.iter().map(|f| f.deletions).sum()
    }

    /// Head commit id, or `None` when upstream reported an empty one.
    pub fn head(&self) -> Option<&str> {
        if self.head_sha.is_empty() {
            None
        } else {
            Some(&self.head_sha)
        }
    }
}

/// Issue severity level.
///
/// # Examples
///
/// ```
/// use prlens_core::Severity;
///
/// let s: Severity = "Warning".parse().unwrap();
/// assert_eq!(s, Severity::Warning);
/// assert!("critical".parse::<Severity>().is_err());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational observation.
    #[default]
    Info,
    /// A potential issue worth investigating.
    Warning,
    /// A likely defect that should be fixed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Issue category.
///
/// # Examples
///
/// ```
/// use prlens_core::Category;
///
/// let c: Category = "best_practice".parse().unwrap();
/// assert_eq!(c, Category::BestPractice);
/// assert_eq!(serde_json::to_string(&c).unwrap(), "\"best_practice\"");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Formatting, naming, readability.
    Style,
    /// Incorrect behavior.
    Bug,
    /// Avoidable cost at runtime.
    Performance,
    /// Maintainability and convention.
    #[default]
    BestPractice,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Style => write!(f, "style"),
            Category::Bug => write!(f, "bug"),
            Category::Performance => write!(f, "performance"),
            Category::BestPractice => write!(f, "best_practice"),
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "style" => Ok(Category::Style),
            "bug" => Ok(Category::Bug),
            "performance" => Ok(Category::Performance),
            "best_practice" => Ok(Category::BestPractice),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

/// A single finding attached to a pull request.
///
/// # Examples
///
/// ```
/// use prlens_core::{AnalysisIssue, Category, Severity};
///
/// let issue = AnalysisIssue {
///     file_path: "src/auth.rs".into(),
///     line: Some(42),
///     severity: Severity::Error,
///     category: Category::Bug,
///     message: "Token compared with ==".into(),
///     suggestion: Some("Use a constant-time comparison".into()),
/// };
/// let json = serde_json::to_value(&issue).unwrap();
/// assert_eq!(json["file_path"], "src/auth.rs");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisIssue {
    /// File the issue refers to.
    pub file_path: String,
    /// Line number, when known.
    pub line: Option<u32>,
    /// Severity of the finding.
    pub severity: Severity,
    /// Category of the finding.
    pub category: Category,
    /// Explanation of the issue.
    pub message: String,
    /// Optional fix suggestion.
    pub suggestion: Option<String>,
}

/// The outcome of one analysis, persisted to the cache and returned to callers.
///
/// Serialized with snake_case keys; this is the cache entry layout.
///
/// # Examples
///
/// ```
/// use prlens_core::AnalysisResult;
///
/// let result = AnalysisResult {
///     repo_url: "https://github.com/octocat/hello-world".into(),
///     pr_number: 7,
///     head_sha: Some("abc123".into()),
///     issues: vec![],
///     summary: "Looks good".into(),
///     model_info: Default::default(),
/// };
/// assert!(result.to_markdown().contains("# Review of octocat/hello-world#7"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Canonical repository URL.
    pub repo_url: String,
    /// Pull request number.
    pub pr_number: u64,
    /// Head commit the analysis ran against.
    pub head_sha: Option<String>,
    /// Findings in emission order.
    pub issues: Vec<AnalysisIssue>,
    /// Free-text summary.
    pub summary: String,
    /// Provider metadata (provider name, model, fallback markers).
    #[serde(default)]
    pub model_info: BTreeMap<String, serde_json::Value>,
}

impl AnalysisResult {
    /// `true` when the result was produced by a fallback path.
    pub fn is_degraded(&self) -> bool {
        self.model_info.contains_key("fallback")
    }

    fn title(&self) -> String {
        let slug = self
            .repo_url
            .trim_end_matches('/')
            .rsplitn(3, '/')
            .take(2)
            .collect::<Vec<_>>();
        match slug.as_slice() {
            [repo, owner] => format!("{owner}/{repo}#{}", self.pr_number),
            _ => format!("{}#{}", self.repo_url, self.pr_number),
        }
    }

    fn provider_label(&self) -> String {
        self.model_info
            .get("provider")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string()
    }

    /// Render the result as markdown.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Review of {}\n\n", self.title()));
        out.push_str(&format!(
            "**Provider:** {} | **Commit:** {} | **Issues:** {}\n\n",
            self.provider_label(),
            self.head_sha.as_deref().unwrap_or(NO_SHA),
            self.issues.len(),
        ));
        out.push_str(&format!("{}\n\n", self.summary));

        if self.issues.is_empty() {
            out.push_str("No issues found.\n");
            return out;
        }
        for issue in &self.issues {
            let location = match issue.line {
                Some(line) => format!("{}:{line}", issue.file_path),
                None => issue.file_path.clone(),
            };
            out.push_str(&format!(
                "## {} ({}) at `{location}`\n\n{}\n\n",
                issue.severity, issue.category, issue.message
            ));
            if let Some(s) = &issue.suggestion {
                out.push_str(&format!("> **Suggestion:** {s}\n\n"));
            }
        }
        out
    }
}

impl fmt::Display for AnalysisResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Review of {}", self.title())?;
        writeln!(
            f,
            "Provider: {} | Commit: {} | Issues: {}\n",
            self.provider_label(),
            self.head_sha.as_deref().unwrap_or(NO_SHA),
            self.issues.len(),
        )?;
        writeln!(f, "{}\n", self.summary)?;

        for issue in &self.issues {
            let label = issue.severity.to_string().to_uppercase();
            match issue.line {
                Some(line) => writeln!(
                    f,
                    "[{label}] {}:{line} ({})",
                    issue.file_path, issue.category
                )?,
                None => writeln!(f, "[{label}] {} ({})", issue.file_path, issue.category)?,
            }
            writeln!(f, "  {}", issue.message)?;
            if let Some(s) = &issue.suggestion {
                writeln!(f, "  Suggestion: {s}")?;
            }
        }
        Ok(())
    }
}

/// Deterministic cache key for one (repository, pull request, commit) triple.
///
/// Layout: `<namespace>:<repo_url>:<pr_number>:<head_sha|no-sha>`.
///
/// # Examples
///
/// ```
/// use prlens_core::CacheKey;
///
/// let key = CacheKey::new("prreview", "https://github.com/o/r", 3, Some("abc"));
/// assert_eq!(key.as_str(), "prreview:https://github.com/o/r:3:abc");
///
/// let key = CacheKey::new("prreview", "https://github.com/o/r", 3, None);
/// assert!(key.as_str().ends_with(":no-sha"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key. An absent or empty `head_sha` maps to [`NO_SHA`].
    pub fn new(namespace: &str, repo_url: &str, pr_number: u64, head_sha: Option<&str>) -> Self {
        let suffix = match head_sha {
            Some(sha) if !sha.is_empty() => sha,
            _ => NO_SHA,
        };
        Self(format!("{namespace}:{repo_url}:{pr_number}:{suffix}"))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output format for CLI subcommands.
///
/// Implements [`FromStr`] so it can be used directly with `clap` argument parsing.
///
/// # Examples
///
/// ```
/// use prlens_core::OutputFormat;
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summaries.
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}
