//! Total, tiered parsing of raw provider text.
//!
//! Tiers, tried in order:
//! 1. a ```` ```json ```` fenced block is extracted if present;
//! 2. the (trimmed, fence-stripped) text is parsed as a JSON object;
//! 3. otherwise the whole text becomes the summary and issues are scraped
//!    line by line from `file:` / `line:` / `severity:` / `message:` markers.
//!
//! Issues come out as untyped [`LooseIssue`] maps. Defaults are applied only
//! by [`crate::coerce`].

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Summary used when a JSON payload has none.
pub const DEFAULT_SUMMARY: &str = "Code review completed";

const ALLOWED_SEVERITIES: [&str; 3] = ["info", "warning", "error"];

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```json\s*(\{.*?\})\s*```").unwrap_or_else(|e| panic!("fence regex: {e}"))
});

/// An issue record before validation: whatever keys the provider produced.
pub type LooseIssue = Map<String, Value>;

/// Which tier produced a [`ParsedReview`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
    /// JSON object found inside a fenced block.
    Fenced,
    /// The text itself was a JSON object.
    Strict,
    /// Marker scan over free text.
    LineHeuristic,
}

impl ParseTier {
    /// Stable name for result metadata.
    pub fn name(self) -> &'static str {
        match self {
            ParseTier::Fenced => "fenced",
            ParseTier::Strict => "strict",
            ParseTier::LineHeuristic => "line_heuristic",
        }
    }
}

/// Output of [`parse_response`].
///
/// # Examples
///
/// ```
/// use prlens_review::parser::{parse_response, ParseTier};
///
/// let parsed = parse_response("```json\n{\"summary\":\"ok\",\"issues\":[]}\n```");
/// assert_eq!(parsed.summary, "ok");
/// assert!(parsed.issues.is_empty());
/// assert_eq!(parsed.tier, ParseTier::Fenced);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReview {
    /// Review summary.
    pub summary: String,
    /// Issue records in emission order.
    pub issues: Vec<LooseIssue>,
    /// Tier that produced this value.
    pub tier: ParseTier,
}

impl ParsedReview {
    /// Serialize as `{"summary": ..., "issues": [...]}`.
    pub fn to_json_text(&self) -> String {
        serde_json::json!({
            "summary": self.summary,
            "issues": self.issues,
        })
        .to_string()
    }
}

/// Parse raw provider text. Never fails.
pub fn parse_response(raw: &str) -> ParsedReview {
    let (candidate, fenced) = match FENCED_JSON.captures(raw).and_then(|c| c.get(1)) {
        Some(m) => (m.as_str(), true),
        None => (raw, false),
    };
    let candidate = strip_code_fences(candidate);

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(object)) => ParsedReview {
            summary: summary_from(&object),
            issues: issues_from(&object),
            tier: if fenced {
                ParseTier::Fenced
            } else {
                ParseTier::Strict
            },
        },
        _ => ParsedReview {
            summary: candidate.to_string(),
            issues: scan_markers(candidate),
            tier: ParseTier::LineHeuristic,
        },
    }
}

fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    if trimmed.len() >= 6 && trimmed.starts_with("```") && trimmed.ends_with("```") {
        let inner = &trimmed[3..trimmed.len() - 3];
        let inner = inner.strip_prefix("json").unwrap_or(inner);
        return inner.trim();
    }
    trimmed
}

fn summary_from(object: &Map<String, Value>) -> String {
    match object.get("summary") {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => DEFAULT_SUMMARY.to_string(),
        Some(other) => other.to_string(),
    }
}

fn issues_from(object: &Map<String, Value>) -> Vec<LooseIssue> {
    let Some(Value::Array(items)) = object.get("issues") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map.clone()),
            Value::Null => None,
            Value::String(s) => Some(message_only(s.clone())),
            other => Some(message_only(other.to_string())),
        })
        .collect()
}

fn message_only(message: String) -> LooseIssue {
    let mut map = Map::new();
    map.insert("message".into(), Value::String(message));
    map
}

/// Return the text after the first occurrence of any marker, ASCII case-insensitively.
fn value_after<'a>(line: &'a str, lower: &str, markers: &[&str]) -> Option<&'a str> {
    markers.iter().find_map(|marker| {
        lower
            .find(marker)
            .map(|at| clean_value(&line[at + marker.len()..]))
    })
}

fn clean_value(value: &str) -> &str {
    value.trim_matches(|c: char| c.is_whitespace() || c == '*' || c == '`' || c == '"')
}

fn scan_markers(text: &str) -> Vec<LooseIssue> {
    let mut issues = Vec::new();
    let mut current = LooseIssue::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        let lower = line.to_ascii_lowercase();

        if let Some(path) = value_after(line, &lower, &["filename:", "file:"]) {
            if !current.is_empty() {
                issues.push(std::mem::take(&mut current));
            }
            current.insert("file_path".into(), Value::String(path.to_string()));
        } else if let Some(value) = value_after(line, &lower, &["line:"]) {
            let line_no = value
                .parse::<u64>()
                .map(Value::from)
                .unwrap_or(Value::Null);
            current.insert("line".into(), line_no);
        } else if let Some(value) = value_after(line, &lower, &["severity:"]) {
            let severity = value.to_ascii_lowercase();
            let severity = if ALLOWED_SEVERITIES.contains(&severity.as_str()) {
                severity
            } else {
                "info".to_string()
            };
            current.insert("severity".into(), Value::String(severity));
        } else if let Some(value) = value_after(line, &lower, &["message:"]) {
            current.insert("message".into(), Value::String(value.to_string()));
        }
    }

    if !current.is_empty() {
        issues.push(current);
    }
    issues
}
