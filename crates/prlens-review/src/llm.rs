use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use prlens_core::{LlmConfig, PrLensError};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::prompt::ReviewMessages;

/// A message in a chat conversation with the LLM.
///
/// # Examples
///
/// ```
/// use prlens_review::llm::{ChatMessage, Role};
///
/// let msg = ChatMessage {
///     role: Role::User,
///     content: "Review this code".into(),
/// };
/// assert!(matches!(msg.role, Role::User));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Text content of the message.
    pub content: String,
}

/// Role in the chat conversation.
///
/// # Examples
///
/// ```
/// use prlens_review::llm::Role;
///
/// let role = Role::System;
/// assert_eq!(serde_json::to_string(&role).unwrap(), "\"system\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

/// Which backend a gateway talks to.
///
/// # Examples
///
/// ```
/// use prlens_review::llm::Provider;
///
/// assert_eq!(Provider::from_name("openai"), Provider::RemoteCommercial);
/// assert_eq!(Provider::from_name("OLLAMA"), Provider::LocalInference);
/// assert_eq!(Provider::from_name("anything"), Provider::LocalInference);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Ollama server, usually on the same host.
    LocalInference,
    /// OpenAI-compatible hosted API.
    RemoteCommercial,
}

impl Provider {
    /// Resolve a configured provider name; unknown names select local inference.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "openai" => Provider::RemoteCommercial,
            _ => Provider::LocalInference,
        }
    }

    /// Short name recorded in result metadata.
    pub fn name(self) -> &'static str {
        match self {
            Provider::LocalInference => "ollama",
            Provider::RemoteCommercial => "openai",
        }
    }
}

/// Classified provider failure. Every variant degrades to the heuristic analyzer.
///
/// # Examples
///
/// ```
/// use prlens_review::llm::ProviderError;
///
/// let err = ProviderError::QuotaExceeded("insufficient_quota".into());
/// assert_eq!(err.kind(), "quota_exceeded");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The backend is not configured or cannot be constructed.
    #[error("provider not available: {0}")]
    NotAvailable(String),

    /// The API key is invalid or expired.
    #[error("provider authentication failed: {0}")]
    AuthFailure(String),

    /// Quota exhausted or billing problem.
    #[error("provider quota exceeded or billing issue: {0}")]
    QuotaExceeded(String),

    /// The backend refused or dropped the connection.
    #[error("provider connection failed: {0}")]
    ConnectionFailure(String),

    /// The configured model is not installed on the backend.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Anything else.
    #[error("provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Stable snake_case tag for metadata and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::NotAvailable(_) => "not_available",
            ProviderError::AuthFailure(_) => "auth_failure",
            ProviderError::QuotaExceeded(_) => "quota_exceeded",
            ProviderError::ConnectionFailure(_) => "connection_failure",
            ProviderError::ModelNotFound(_) => "model_not_found",
            ProviderError::Unknown(_) => "unknown",
        }
    }
}

/// Raw text returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReply {
    /// Provider name, e.g. `"ollama"`.
    pub provider: String,
    /// Model that produced the text.
    pub model: String,
    /// Unparsed response text.
    pub text: String,
}

/// Either raw text or a classified failure.
pub type ProviderOutcome = Result<ProviderReply, ProviderError>;

/// A backend that can review a pull request given prepared messages.
///
/// Implementations attempt exactly once and never retry.
#[async_trait]
pub trait ReviewProvider: Send + Sync {
    /// Provider name recorded in result metadata.
    fn name(&self) -> &str;

    /// Model identifier recorded in result metadata.
    fn model(&self) -> &str;

    /// Send the messages and return the raw reply or a classified failure.
    async fn invoke(&self, messages: &ReviewMessages) -> ProviderOutcome;
}

/// Gateway to the single configured LLM backend.
///
/// # Examples
///
/// ```
/// use prlens_core::LlmConfig;
/// use prlens_review::llm::{Provider, ProviderGateway};
///
/// let gateway = ProviderGateway::new(&LlmConfig::default()).unwrap();
/// assert_eq!(gateway.provider(), Provider::LocalInference);
/// assert_eq!(gateway.model_name(), "llama3");
/// ```
pub struct ProviderGateway {
    client: reqwest::Client,
    provider: Provider,
    config: LlmConfig,
}

impl ProviderGateway {
    /// Create a gateway for the provider named in `config.provider`.
    ///
    /// # Errors
    ///
    /// Returns [`PrLensError::Llm`] if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self, PrLensError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PrLensError::Llm(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            provider: Provider::from_name(&config.provider),
            config: config.clone(),
        })
    }

    /// The selected backend.
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Model identifier for the selected backend.
    pub fn model_name(&self) -> &str {
        match self.provider {
            Provider::LocalInference => &self.config.ollama.model,
            Provider::RemoteCommercial => &self.config.openai.model,
        }
    }

    /// List models installed on the local inference backend.
    ///
    /// Used by health checks; independent of the selected provider.
    pub async fn list_local_models(&self) -> Result<Vec<String>, ProviderError> {
        let base = self.ollama_base()?;
        let response = self
            .client
            .get(format!("{base}/api/tags"))
            .send()
            .await
            .map_err(classify_local_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_local_error(Some(status.as_u16()), &body));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("failed to parse model list: {e}")))?;
        Ok(body
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// `true` when the remote provider has an API key configured.
    pub fn remote_configured(&self) -> bool {
        self.config
            .openai
            .api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty())
    }

    fn ollama_base(&self) -> Result<&str, ProviderError> {
        let base = self.config.ollama.base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(ProviderError::NotAvailable(
                "local inference backend has no base_url configured".into(),
            ));
        }
        if url::Url::parse(base).is_err() {
            return Err(ProviderError::NotAvailable(format!(
                "local inference base_url is not a valid URL: {base}"
            )));
        }
        Ok(base)
    }

    async fn chat_local(&self, messages: &ReviewMessages) -> Result<String, ProviderError> {
        let base = self.ollama_base()?;
        let body = serde_json::json!({
            "model": self.config.ollama.model,
            "messages": messages.as_slice(),
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{base}/api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(classify_local_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_local_error(Some(status.as_u16()), &body_text));
        }

        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("failed to parse response: {e}")))?;

        response_body
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::Unknown(format!("unexpected response structure: {response_body}"))
            })
    }

    async fn chat_remote(&self, messages: &ReviewMessages) -> Result<String, ProviderError> {
        let Some(api_key) = self
            .config
            .openai
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
        else {
            return Err(ProviderError::NotAvailable(
                "OPENAI_API_KEY not configured".into(),
            ));
        };

        let base = self.config.openai.base_url.trim_end_matches('/');
        let body = serde_json::json!({
            "model": self.config.openai.model,
            "messages": messages.as_slice(),
            "temperature": self.config.openai.temperature,
        });

        let response = self
            .client
            .post(format!("{base}/v1/chat/completions"))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ProviderError::ConnectionFailure(error_chain(&e))
                } else {
                    classify_remote_error(None, &error_chain(&e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_remote_error(Some(status.as_u16()), &body_text));
        }

        let response_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(format!("failed to parse response: {e}")))?;

        let choice = response_body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| {
                ProviderError::Unknown(format!("unexpected response structure: {response_body}"))
            })?;
        // A null content (e.g. a refusal) still counts as a reply.
        Ok(choice
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("{}")
            .to_string())
    }
}

#[async_trait]
impl ReviewProvider for ProviderGateway {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn model(&self) -> &str {
        self.model_name()
    }

    async fn invoke(&self, messages: &ReviewMessages) -> ProviderOutcome {
        let provider = self.provider.name();
        let model = self.model_name().to_string();
        info!(provider, model = %model, "invoking provider");

        let result = match self.provider {
            Provider::LocalInference => self.chat_local(messages).await,
            Provider::RemoteCommercial => self.chat_remote(messages).await,
        };

        match result {
            Ok(text) => {
                info!(provider, model = %model, chars = text.len(), "provider replied");
                Ok(ProviderReply {
                    provider: provider.to_string(),
                    model,
                    text,
                })
            }
            Err(e) => {
                error!(provider, model = %model, kind = e.kind(), error = %e, "provider call failed");
                Err(e)
            }
        }
    }
}

/// Classify a local inference failure from its status code and error text.
///
/// # Examples
///
/// ```
/// use prlens_review::llm::{classify_local_error, ProviderError};
///
/// let err = classify_local_error(None, "dial tcp: Connection refused");
/// assert!(matches!(err, ProviderError::ConnectionFailure(_)));
/// ```
pub fn classify_local_error(status: Option<u16>, text: &str) -> ProviderError {
    let lower = text.to_lowercase();
    if status == Some(404)
        || lower.contains("model not found")
        || (lower.contains("model") && lower.contains("not found"))
    {
        ProviderError::ModelNotFound(text.to_string())
    } else if lower.contains("connection refused") {
        ProviderError::ConnectionFailure(text.to_string())
    } else {
        match status {
            Some(code) => ProviderError::Unknown(format!("Ollama API error {code}: {text}")),
            None => ProviderError::Unknown(text.to_string()),
        }
    }
}

/// Classify a remote provider failure from its status code and error text.
///
/// # Examples
///
/// ```
/// use prlens_review::llm::{classify_remote_error, ProviderError};
///
/// let err = classify_remote_error(Some(429), "You exceeded your current quota");
/// assert!(matches!(err, ProviderError::QuotaExceeded(_)));
/// ```
pub fn classify_remote_error(status: Option<u16>, text: &str) -> ProviderError {
    let lower = text.to_lowercase();
    if lower.contains("quota") || lower.contains("billing") {
        ProviderError::QuotaExceeded(text.to_string())
    } else if status == Some(401) || lower.contains("authentication") {
        ProviderError::AuthFailure(text.to_string())
    } else {
        match status {
            Some(code) => ProviderError::Unknown(format!("OpenAI API error {code}: {text}")),
            None => ProviderError::Unknown(text.to_string()),
        }
    }
}

fn classify_local_transport(e: reqwest::Error) -> ProviderError {
    let text = error_chain(&e);
    if e.is_connect() {
        ProviderError::ConnectionFailure(text)
    } else {
        classify_local_error(None, &text)
    }
}

/// Flatten an error and its sources into one line.
fn error_chain(e: &(dyn StdError + 'static)) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}
