use std::fmt::Write;

use prlens_core::PrSnapshot;

use crate::llm::{ChatMessage, Role};

const SYSTEM_PROMPT: &str = "\
You are an expert code reviewer. Provide detailed, actionable feedback.

Return a strict JSON object with keys: summary (string), issues (array of issue objects). \
Each issue object must have: file_path (string), line (number or null), \
severity (info|warning|error), category (style|bug|performance|best_practice), \
message (string), suggestion (string or null). \
Do not include any extra commentary, only JSON.";

const REVIEW_BRIEF: &str = "\
You are a senior software engineer with years of experience writing and reviewing code. \
Review this pull request and tell us:

- Whether the changes are good to merge, after analysing them in depth
- If they are, the best way to land them: tests, coverage, performance, security, best practices
- If they are not, the best way to fix them
- What is good about the changes
- Any issues (bugs, style, performance, best practices)
- An overall assessment
";

const CLOSING: &str = "Please provide a detailed code review with specific issues and suggestions.";

/// The ordered messages sent to a provider: one system instruction, one user body.
///
/// Only [`build_review_messages`] constructs it, so the shape always holds.
///
/// # Examples
///
/// ```
/// use prlens_core::PrSnapshot;
/// use prlens_review::llm::Role;
/// use prlens_review::prompt::build_review_messages;
///
/// let snapshot = PrSnapshot {
///     owner: "octocat".into(),
///     repo: "hello-world".into(),
///     number: 1,
///     title: "Fix typo".into(),
///     body: None,
///     head_sha: "abc".into(),
///     base_sha: "def".into(),
///     files: vec![],
///     diff: String::new(),
/// };
/// let messages = build_review_messages(&snapshot);
/// assert_eq!(messages.as_slice().len(), 2);
/// assert_eq!(messages.as_slice()[0].role, Role::System);
/// assert!(messages.user().contains("octocat/hello-world"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewMessages {
    messages: [ChatMessage; 2],
}

impl ReviewMessages {
    /// Messages in send order.
    pub fn as_slice(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The system instruction text.
    pub fn system(&self) -> &str {
        &self.messages[0].content
    }

    /// The user body text.
    pub fn user(&self) -> &str {
        &self.messages[1].content
    }
}

/// Build the system prompt fixing the reviewer persona and output schema.
pub fn build_system_prompt() -> String {
    SYSTEM_PROMPT.to_string()
}

/// Build the user prompt embedding the pull request.
///
/// # Examples
///
/// ```
/// use prlens_core::{ChangedFile, FileStatus, PrSnapshot};
/// use prlens_review::prompt::build_review_prompt;
///
/// let snapshot = PrSnapshot {
///     owner: "o".into(),
///     repo: "r".into(),
///     number: 4,
///     title: "Add cache".into(),
///     body: None,
///     head_sha: "h".into(),
///     base_sha: "b".into(),
///     files: vec![ChangedFile {
///         path: "src/cache.rs".into(),
///         status: FileStatus::Added,
///         additions: 10,
///         deletions: 0,
///         changes: 10,
///         patch: Some("+pub struct Cache;".into()),
///         raw_url: None,
///     }],
///     diff: String::new(),
/// };
/// let prompt = build_review_prompt(&snapshot);
/// assert!(prompt.contains("File: src/cache.rs"));
/// assert!(prompt.contains("+pub struct Cache;"));
/// ```
pub fn build_review_prompt(snapshot: &PrSnapshot) -> String {
    let mut user = String::with_capacity(snapshot.diff.len() + 1024);
    user.push_str(REVIEW_BRIEF);

    let _ = writeln!(user, "\nPR Details:");
    let _ = writeln!(user, "- Repository: {}", snapshot.slug());
    let _ = writeln!(user, "- PR #{}: {}", snapshot.number, snapshot.title);
    if let Some(body) = snapshot.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        let _ = writeln!(user, "- Description:\n{body}");
    }
    let _ = writeln!(user, "- Files changed: {}", snapshot.files.len());
    let _ = writeln!(
        user,
        "- Total changes: +{} -{}",
        snapshot.total_additions(),
        snapshot.total_deletions()
    );
    let _ = writeln!(user, "\nFiles and Changes:");

    for file in &snapshot.files {
        let _ = writeln!(user, "\nFile: {}", file.path);
        let _ = writeln!(user, "Status: {}", file.status);
        let _ = writeln!(user, "Changes: +{} -{}", file.additions, file.deletions);
        if let Some(patch) = &file.patch {
            let _ = writeln!(user, "Diff:\n{patch}");
        }
        user.push_str(&"-".repeat(50));
        user.push('\n');
    }

    let _ = write!(user, "\n{CLOSING}");
    user
}

/// Build the full message pair for a snapshot. Pure and total.
pub fn build_review_messages(snapshot: &PrSnapshot) -> ReviewMessages {
    ReviewMessages {
        messages: [
            ChatMessage {
                role: Role::System,
                content: build_system_prompt(),
            },
            ChatMessage {
                role: Role::User,
                content: build_review_prompt(snapshot),
            },
        ],
    }
}
