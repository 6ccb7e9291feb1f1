use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use prlens_core::{ChangedFile, FetchError, FileStatus, GitHubConfig, PrLensError, PrSnapshot};
use serde::Deserialize;
use tracing::{debug, info};

use crate::pool::WorkerPool;

/// GitHub returns at most 100 files per page and 3000 files per pull request.
const FILES_PER_PAGE: usize = 100;
const MAX_FILE_PAGES: usize = 30;

/// Source of pull request snapshots.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Fetch metadata, changed files, and the unified diff of one pull request.
    ///
    /// # Errors
    ///
    /// Every failure is a [`FetchError`]; all of them are fatal to the job.
    async fn fetch(
        &self,
        repo_url: &str,
        pr_number: u64,
        token: Option<&str>,
    ) -> Result<PrSnapshot, FetchError>;
}

/// Split a repository URL into `(owner, repo)`.
///
/// Accepts `<scheme>://<host>/<owner>/<repo>[.git]` with optional trailing
/// path segments; a missing scheme is treated as `https`.
///
/// # Errors
///
/// Returns [`FetchError::InvalidRepoUrl`] if the owner or repository is missing.
///
/// # Examples
///
/// ```
/// use prlens_review::github::parse_repo_url;
///
/// let (owner, repo) = parse_repo_url("https://github.com/rust-lang/rust.git").unwrap();
/// assert_eq!(owner, "rust-lang");
/// assert_eq!(repo, "rust");
///
/// assert!(parse_repo_url("https://github.com/rust-lang").is_err());
/// ```
pub fn parse_repo_url(repo_url: &str) -> Result<(String, String), FetchError> {
    let invalid = || FetchError::InvalidRepoUrl(repo_url.to_string());
    let trimmed = repo_url.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = url::Url::parse(&with_scheme).map_err(|_| invalid())?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    let mut segments = parsed
        .path_segments()
        .ok_or_else(invalid)?
        .filter(|s| !s.is_empty());
    let owner = segments.next().ok_or_else(invalid)?;
    let repo = segments.next().ok_or_else(invalid)?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        return Err(invalid());
    }
    Ok((owner.to_string(), repo.to_string()))
}

#[derive(Debug, Deserialize)]
struct PullPayload {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    head: CommitRef,
    base: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentPayload {
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    content: String,
}

/// GitHub REST client producing [`PrSnapshot`]s.
///
/// # Examples
///
/// ```
/// use prlens_core::GitHubConfig;
/// use prlens_review::github::GitHubFetcher;
/// use prlens_review::pool::WorkerPool;
///
/// let fetcher = GitHubFetcher::new(&GitHubConfig::default(), WorkerPool::new(3)).unwrap();
/// # drop(fetcher);
/// ```
pub struct GitHubFetcher {
    client: reqwest::Client,
    config: GitHubConfig,
    pool: WorkerPool,
}

impl GitHubFetcher {
    /// Create a fetcher. File normalization runs on `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &GitHubConfig, pool: WorkerPool) -> Result<Self, PrLensError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("prlens/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PrLensError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
            pool,
        })
    }

    fn repo_api(&self, owner: &str, repo: &str) -> String {
        format!(
            "{}/repos/{owner}/{repo}",
            self.config.api_base.trim_end_matches('/')
        )
    }

    fn get(&self, url: &str, token: Option<&str>, accept: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url).header("Accept", accept);
        let token = token
            .filter(|t| !t.trim().is_empty())
            .or(self.config.token.as_deref().filter(|t| !t.trim().is_empty()));
        match token {
            Some(t) => request.bearer_auth(t),
            None => request,
        }
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, FetchError> {
        request.send().await.map_err(transport_error)
    }

    /// Fetch one page of raw file entries.
    async fn files_page(
        &self,
        api: &str,
        pr_number: u64,
        page: usize,
        token: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, FetchError> {
        let url = format!("{api}/pulls/{pr_number}/files?per_page={FILES_PER_PAGE}&page={page}");
        let response = Self::send(self.get(&url, token, "application/vnd.github+json")).await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(secondary_status_error(status, "couldn't get PR files"));
        }
        response
            .json()
            .await
            .map_err(|e| FetchError::Unknown(format!("invalid files payload: {e}")))
    }

    /// Read a file at `git_ref`. Returns `None` when the file does not exist
    /// or is not base64-encoded content.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] for invalid URLs and API or transport failures.
    pub async fn file_content(
        &self,
        repo_url: &str,
        git_ref: &str,
        path: &str,
        token: Option<&str>,
    ) -> Result<Option<String>, FetchError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let mut url = url::Url::parse(&self.repo_api(&owner, &repo))
            .map_err(|e| FetchError::Unknown(format!("invalid API base: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| FetchError::Unknown("invalid API base".into()))?
            .push("contents")
            .extend(path.split('/').filter(|s| !s.is_empty()));
        url.query_pairs_mut().append_pair("ref", git_ref);

        let response =
            Self::send(self.get(url.as_str(), token, "application/vnd.github+json")).await?;
        let status = response.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        if status != 200 {
            return Err(secondary_status_error(status, "couldn't get file content"));
        }
        let payload: ContentPayload = response
            .json()
            .await
            .map_err(|e| FetchError::Unknown(format!("invalid content payload: {e}")))?;
        if payload.encoding.as_deref() != Some("base64") {
            return Ok(None);
        }
        let compact: String = payload
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| FetchError::Unknown(format!("invalid base64 content: {e}")))?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[async_trait]
impl SnapshotFetcher for GitHubFetcher {
    async fn fetch(
        &self,
        repo_url: &str,
        pr_number: u64,
        token: Option<&str>,
    ) -> Result<PrSnapshot, FetchError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let api = self.repo_api(&owner, &repo);
        info!(owner = %owner, repo = %repo, pr = pr_number, "fetching pull request");

        let response = Self::send(self.get(
            &format!("{api}/pulls/{pr_number}"),
            token,
            "application/vnd.github+json",
        ))
        .await?;
        match response.status().as_u16() {
            200 => {}
            404 => {
                return Err(FetchError::NotFound {
                    owner,
                    repo,
                    number: pr_number,
                })
            }
            401 => return Err(FetchError::AuthFailed),
            403 | 429 => return Err(FetchError::AccessDenied),
            code => {
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::Unknown(format!("{code}: {body}")));
            }
        }
        let pull: PullPayload = response
            .json()
            .await
            .map_err(|e| FetchError::Unknown(format!("invalid pull request payload: {e}")))?;

        let mut raw_files = Vec::new();
        for page in 1..=MAX_FILE_PAGES {
            let batch = self.files_page(&api, pr_number, page, token).await?;
            let last = batch.len() < FILES_PER_PAGE;
            raw_files.extend(batch);
            if last {
                break;
            }
        }
        debug!(count = raw_files.len(), "normalizing changed files");
        let files = self
            .pool
            .run(move || {
                raw_files
                    .into_iter()
                    .filter_map(normalize_file)
                    .collect::<Vec<_>>()
            })
            .await
            .map_err(|e| FetchError::Unknown(e.to_string()))?;

        let response = Self::send(self.get(
            &format!("{api}/pulls/{pr_number}"),
            token,
            "application/vnd.github.v3.diff",
        ))
        .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(secondary_status_error(status, "couldn't get PR diff"));
        }
        let diff = response.text().await.map_err(transport_error)?;

        info!(owner = %owner, repo = %repo, pr = pr_number, files = files.len(), "fetched pull request");
        Ok(PrSnapshot {
            owner,
            repo,
            number: pr_number,
            title: pull.title.unwrap_or_default(),
            body: pull.body,
            head_sha: pull.head.sha,
            base_sha: pull.base.sha,
            files,
            diff,
        })
    }
}

/// Build a [`ChangedFile`] from one raw API entry. Entries without a filename are dropped.
fn normalize_file(raw: serde_json::Value) -> Option<ChangedFile> {
    let path = raw.get("filename")?.as_str()?.to_string();
    let count = |key: &str| raw.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    let text = |key: &str| raw.get(key).and_then(|v| v.as_str()).map(String::from);
    let status = raw
        .get("status")
        .cloned()
        .and_then(|s| serde_json::from_value::<FileStatus>(s).ok())
        .unwrap_or(FileStatus::Modified);
    Some(ChangedFile {
        path,
        status,
        additions: count("additions"),
        deletions: count("deletions"),
        changes: count("changes"),
        patch: text("patch"),
        raw_url: text("raw_url"),
    })
}

fn secondary_status_error(status: u16, what: &str) -> FetchError {
    match status {
        401 => FetchError::AuthFailed,
        403 | 429 => FetchError::AccessDenied,
        code => FetchError::Unknown(format!("{what}: {code}")),
    }
}

fn transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        return FetchError::Timeout;
    }
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    FetchError::Network(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PULL: &str = r#"{"title":"Add retries","body":null,"head":{"sha":"abc123"},"base":{"sha":"def456"}}"#;
    const FILES: &str = r#"[
        {"filename":"src/net.rs","status":"modified","additions":4,"deletions":1,"changes":5,"patch":"@@ -1 +1 @@\n+retry()","raw_url":"https://example.invalid/raw"},
        {"filename":"img/logo.png","status":"mystery","additions":0,"deletions":0,"changes":0},
        {"status":"added"}
    ]"#;
    const DIFF: &str = "diff --git a/src/net.rs b/src/net.rs\n+retry()\n";

    fn fetcher(api_base: String) -> GitHubFetcher {
        let config = GitHubConfig {
            token: None,
            api_base,
            timeout_secs: 5,
        };
        GitHubFetcher::new(&config, WorkerPool::new(2)).unwrap()
    }

    fn json(status: u16, body: &str) -> ResponseTemplate {
        ResponseTemplate::new(status).set_body_raw(body.to_string(), "application/json")
    }

    /// A base URL with nothing listening behind it.
    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[test]
    fn repo_url_forms() {
        let ok = |url: &str| parse_repo_url(url).unwrap();
        assert_eq!(ok("https://github.com/o/r"), ("o".into(), "r".into()));
        assert_eq!(ok("https://github.com/o/r.git"), ("o".into(), "r".into()));
        assert_eq!(ok("https://github.com/o/r/"), ("o".into(), "r".into()));
        assert_eq!(ok("https://github.com/o/r/pull/12"), ("o".into(), "r".into()));
        assert_eq!(ok("github.com/o/r"), ("o".into(), "r".into()));
        assert_eq!(ok("http://git.example.com/team/tool"), ("team".into(), "tool".into()));
    }

    #[test]
    fn malformed_repo_urls_are_rejected() {
        for url in ["", "https://github.com", "https://github.com/owner", "https://github.com/o/.git", "::::"] {
            assert!(
                matches!(parse_repo_url(url), Err(FetchError::InvalidRepoUrl(_))),
                "accepted {url:?}"
            );
        }
    }

    #[test]
    fn unknown_file_status_becomes_modified() {
        let file = normalize_file(serde_json::json!({"filename": "a", "status": "odd"})).unwrap();
        assert_eq!(file.status, FileStatus::Modified);
        assert_eq!(file.additions, 0);
        assert!(normalize_file(serde_json::json!({"status": "added"})).is_none());
    }

    #[tokio::test]
    async fn fetch_builds_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/net/pulls/5"))
            .and(header("accept", "application/vnd.github+json"))
            .and(bearer_token("tok"))
            .respond_with(json(200, PULL))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/net/pulls/5/files"))
            .and(query_param("per_page", "100"))
            .and(query_param("page", "1"))
            .and(bearer_token("tok"))
            .respond_with(json(200, FILES))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/net/pulls/5"))
            .and(header("accept", "application/vnd.github.v3.diff"))
            .and(bearer_token("tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DIFF))
            .expect(1)
            .mount(&server)
            .await;

        let snapshot = fetcher(server.uri())
            .fetch("https://github.com/acme/net", 5, Some("tok"))
            .await
            .unwrap();

        assert_eq!(snapshot.owner, "acme");
        assert_eq!(snapshot.repo, "net");
        assert_eq!(snapshot.number, 5);
        assert_eq!(snapshot.title, "Add retries");
        assert_eq!(snapshot.body, None);
        assert_eq!(snapshot.head_sha, "abc123");
        assert_eq!(snapshot.base_sha, "def456");
        assert_eq!(snapshot.diff, DIFF);
        assert_eq!(snapshot.files.len(), 2);
        assert_eq!(snapshot.files[0].path, "src/net.rs");
        assert_eq!(snapshot.files[0].changes, 5);
        assert_eq!(snapshot.files[0].patch.as_deref(), Some("@@ -1 +1 @@\n+retry()"));
        assert_eq!(snapshot.files[1].status, FileStatus::Modified);
        assert_eq!(snapshot.files[1].patch, None);
    }

    #[tokio::test]
    async fn file_list_is_paginated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/net/pulls/8"))
            .and(header("accept", "application/vnd.github+json"))
            .respond_with(json(200, PULL))
            .mount(&server)
            .await;
        let full_page: Vec<serde_json::Value> = (0..FILES_PER_PAGE)
            .map(|i| serde_json::json!({"filename": format!("f{i}.rs"), "status": "added"}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/repos/acme/net/pulls/8/files"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(full_page))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/net/pulls/8/files"))
            .and(query_param("page", "2"))
            .respond_with(json(200, r#"[{"filename":"last.rs","status":"removed"}]"#))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/net/pulls/8"))
            .and(header("accept", "application/vnd.github.v3.diff"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DIFF))
            .mount(&server)
            .await;

        let snapshot = fetcher(server.uri())
            .fetch("https://github.com/acme/net", 8, None)
            .await
            .unwrap();
        assert_eq!(snapshot.files.len(), FILES_PER_PAGE + 1);
        assert_eq!(snapshot.files[FILES_PER_PAGE].path, "last.rs");
        assert_eq!(snapshot.files[FILES_PER_PAGE].status, FileStatus::Removed);
    }

    #[tokio::test]
    async fn configured_token_is_used_when_request_has_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b/pulls/1"))
            .and(bearer_token("from-config"))
            .respond_with(json(404, r#"{"message":"Not Found"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let config = GitHubConfig {
            token: Some("from-config".into()),
            api_base: server.uri(),
            timeout_secs: 5,
        };
        let fetcher = GitHubFetcher::new(&config, WorkerPool::new(1)).unwrap();
        let err = fetcher.fetch("https://github.com/a/b", 1, Some("  ")).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn missing_pull_request_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/net/pulls/99"))
            .respond_with(json(404, r#"{"message":"Not Found"}"#))
            .mount(&server)
            .await;

        let err = fetcher(server.uri())
            .fetch("https://github.com/acme/net", 99, None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::NotFound {
                owner: "acme".into(),
                repo: "net".into(),
                number: 99
            }
        );
        assert_eq!(err.to_string(), "PR #99 doesn't exist in acme/net");
    }

    #[tokio::test]
    async fn auth_and_access_statuses_are_classified() {
        for (status, expected) in [
            (401, FetchError::AuthFailed),
            (403, FetchError::AccessDenied),
            (429, FetchError::AccessDenied),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/repos/a/b/pulls/1"))
                .respond_with(json(status, r#"{"message":"nope"}"#))
                .mount(&server)
                .await;
            let err = fetcher(server.uri())
                .fetch("https://github.com/a/b", 1, Some("bad"))
                .await
                .unwrap_err();
            assert_eq!(err, expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn unexpected_status_is_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b/pulls/1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;
        let err = fetcher(server.uri())
            .fetch("https://github.com/a/b", 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unknown(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let err = fetcher(closed_port_url())
            .fetch("https://github.com/a/b", 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }

    #[tokio::test]
    async fn invalid_url_fails_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        let err = fetcher(server.uri())
            .fetch("https://github.com/only-owner", 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidRepoUrl(_)));
    }

    #[tokio::test]
    async fn file_content_decodes_base64() {
        let server = MockServer::start().await;
        // "fn main() {}\n" split across lines the way the API wraps it.
        Mock::given(method("GET"))
            .and(path("/repos/a/b/contents/src/main.rs"))
            .and(query_param("ref", "main"))
            .respond_with(json(
                200,
                r#"{"encoding":"base64","content":"Zm4gbWFp\nbigpIHt9Cg==\n"}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        let content = fetcher(server.uri())
            .file_content("https://github.com/a/b", "main", "src/main.rs", None)
            .await
            .unwrap();
        assert_eq!(content.as_deref(), Some("fn main() {}\n"));
    }

    #[tokio::test]
    async fn file_content_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/a/b/contents/nope.rs"))
            .respond_with(json(404, r#"{"message":"Not Found"}"#))
            .mount(&server)
            .await;
        let content = fetcher(server.uri())
            .file_content("https://github.com/a/b", "main", "nope.rs", None)
            .await
            .unwrap();
        assert_eq!(content, None);
    }
}
