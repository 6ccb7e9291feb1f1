//! Turn loose issue maps into validated [`AnalysisIssue`]s.
//!
//! This is the only place where defaults are filled in.

use prlens_core::{AnalysisIssue, Category, Severity};
use serde_json::Value;

use crate::parser::LooseIssue;

/// File path used when an issue names none.
pub const UNKNOWN_FILE: &str = "unknown";

/// Message used when an issue carries no usable text.
pub const UNPARSED_MESSAGE: &str = "Unparsed issue";

const PATH_KEYS: [&str; 4] = ["file_path", "file", "filename", "path"];

/// Coerce one loose issue. Total: every input yields a valid issue.
///
/// # Examples
///
/// ```
/// use prlens_core::{Category, Severity};
/// use prlens_review::coerce::coerce_issue;
///
/// let loose = serde_json::json!({"file": "a.rs", "line": "7", "severity": "ERROR"});
/// let issue = coerce_issue(loose.as_object().unwrap());
/// assert_eq!(issue.file_path, "a.rs");
/// assert_eq!(issue.line, Some(7));
/// assert_eq!(issue.severity, Severity::Error);
/// assert_eq!(issue.category, Category::BestPractice);
/// assert_eq!(issue.message, "Unparsed issue");
/// ```
pub fn coerce_issue(loose: &LooseIssue) -> AnalysisIssue {
    let file_path = PATH_KEYS
        .iter()
        .find_map(|key| non_empty_text(loose.get(*key)))
        .unwrap_or_else(|| UNKNOWN_FILE.to_string());

    let severity = loose
        .get("severity")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Severity>().ok())
        .unwrap_or_default();

    let category = loose
        .get("category")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Category>().ok())
        .unwrap_or_default();

    let message = non_empty_text(loose.get("message"))
        .unwrap_or_else(|| UNPARSED_MESSAGE.to_string());

    let suggestion = loose
        .get("suggestion")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    AnalysisIssue {
        file_path,
        line: loose.get("line").and_then(line_number),
        severity,
        category,
        message,
        suggestion,
    }
}

/// Coerce a list of loose issues, preserving order.
pub fn coerce_issues(loose: &[LooseIssue]) -> Vec<AnalysisIssue> {
    loose.iter().map(coerce_issue).collect()
}

/// Strings as-is, numbers and booleans as text; blank or structured values are dropped.
fn non_empty_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Positive integers only; accepts JSON numbers, whole floats, and numeric strings.
fn line_number(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => match n.as_u64() {
            Some(n) => n,
            None => {
                let f = n.as_f64()?;
                if f.fract() != 0.0 || f < 1.0 {
                    return None;
                }
                f as u64
            }
        },
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u32::try_from(n).ok().filter(|n| *n > 0)
}
