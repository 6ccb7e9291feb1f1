//! Diff-only static pattern scan used when no provider output is available.
//!
//! Reported line numbers are 1-based positions within the file's patch text,
//! not lines in the file itself.

use prlens_core::{AnalysisIssue, Category, PrSnapshot, Severity};

/// Summary attached to every heuristic result.
pub const HEURISTIC_SUMMARY: &str =
    "Automatic scan completed. Consider running a full AI review for deeper insights.";

/// Added lines longer than this (in characters, excluding the `+`) are flagged.
pub const MAX_LINE_CHARS: usize = 120;

const DEBUG_CALLS: [&str; 2] = ["print(", "console.log("];
const LEFTOVER_MARKERS: [&str; 2] = ["TODO", "FIXME"];

/// Output of [`analyze`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicReport {
    /// Fixed advisory summary.
    pub summary: String,
    /// Findings ordered by file, then patch line, then rule.
    pub issues: Vec<AnalysisIssue>,
}

/// Scan the added lines of every patched file. Pure and total.
///
/// # Examples
///
/// ```
/// use prlens_core::{ChangedFile, FileStatus, PrSnapshot, Severity};
/// use prlens_review::heuristic::analyze;
///
/// let snapshot = PrSnapshot {
///     owner: "o".into(),
///     repo: "r".into(),
///     number: 1,
///     title: "t".into(),
///     body: None,
///     head_sha: "h".into(),
///     base_sha: "b".into(),
///     files: vec![ChangedFile {
///         path: "app.py".into(),
///         status: FileStatus::Modified,
///         additions: 1,
///         deletions: 0,
///         changes: 1,
///         patch: Some("@@ -1 +1,2 @@\n import os\n+print(os.environ)".into()),
///         raw_url: None,
///     }],
///     diff: String::new(),
/// };
/// let report = analyze(&snapshot);
/// assert_eq!(report.issues.len(), 1);
/// assert_eq!(report.issues[0].severity, Severity::Warning);
/// assert_eq!(report.issues[0].line, Some(3));
/// ```
pub fn analyze(snapshot: &PrSnapshot) -> HeuristicReport {
    let mut issues = Vec::new();

    for file in &snapshot.files {
        let Some(patch) = file.patch.as_deref() else {
            continue;
        };

        for (index, line) in patch.lines().enumerate() {
            let Some(added) = line.strip_prefix('+') else {
                continue;
            };
            let line_no = u32::try_from(index + 1).ok();
            let issue = |severity, category, message: &str, suggestion: &str| AnalysisIssue {
                file_path: file.path.clone(),
                line: line_no,
                severity,
                category,
                message: message.to_string(),
                suggestion: Some(suggestion.to_string()),
            };

            if DEBUG_CALLS.iter().any(|call| added.contains(call)) {
                issues.push(issue(
                    Severity::Warning,
                    Category::BestPractice,
                    "Debug logging found in committed code",
                    "Remove debug prints or guard them behind log levels",
                ));
            }
            if added.chars().count() > MAX_LINE_CHARS {
                issues.push(issue(
                    Severity::Info,
                    Category::Style,
                    "Very long line added (>120 chars)",
                    "Wrap long lines to improve readability",
                ));
            }
            if LEFTOVER_MARKERS.iter().any(|m| added.contains(m)) {
                issues.push(issue(
                    Severity::Info,
                    Category::BestPractice,
                    "Leftover TODO/FIXME in changes",
                    "Track in issue tracker or resolve before merge",
                ));
            }
        }
    }

    HeuristicReport {
        summary: HEURISTIC_SUMMARY.to_string(),
        issues,
    }
}
