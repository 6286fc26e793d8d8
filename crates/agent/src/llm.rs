use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clerk_core::config::{LlmConfig, LlmProvider};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Which stage of the turn issued a completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Purpose {
    Extraction,
    Planning,
    Synthesis,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Planning => "planning",
            Self::Synthesis => "synthesis",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub purpose: Purpose,
    pub system: String,
    pub prompt: String,
    /// JSON schema the answer must follow; `None` asks for free text.
    pub schema: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    Text(String),
    Structured(Value),
}

impl Completion {
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Structured(value) => value.to_string(),
        }
    }

    /// Structured answers pass through; text answers are searched for the
    /// outermost JSON object.
    pub fn into_structured(self) -> Result<Value, String> {
        match self {
            Self::Structured(value) => Ok(value),
            Self::Text(text) => {
                let json = extract_json(&text)
                    .ok_or_else(|| "completion did not contain a JSON object".to_string())?;
                serde_json::from_str(json).map_err(|error| error.to_string())
            }
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("llm provider error (transient: {transient}): {message}")]
pub struct ProviderError {
    pub transient: bool,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { transient: true, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { transient: false, message: message.into() }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError>;
}

#[async_trait]
impl LlmClient for Arc<dyn LlmClient> {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        (**self).complete(request).await
    }
}

/// Provider used when no model is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineLlm;

#[async_trait]
impl LlmClient for OfflineLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        Err(ProviderError::permanent(format!(
            "llm provider is offline; {} completion skipped",
            request.purpose.as_str()
        )))
    }
}

/// Client for OpenAI-compatible `chat/completions` endpoints (OpenAI, Ollama).
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    max_retries: u32,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ProviderError> {
        let base_url = match (&config.base_url, config.provider) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, LlmProvider::OpenAi) => "https://api.openai.com/v1".to_string(),
            (None, _) => {
                return Err(ProviderError::permanent("llm.base_url is required for this provider"))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| ProviderError::permanent(error.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{base_url}/chat/completions"),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn send_once(&self, body: &ChatRequest) -> Result<String, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = format!("Bearer {}", key.expose_secret());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value)
                    .map_err(|error| ProviderError::permanent(error.to_string()))?,
            );
        }

        let response =
            self.client.post(&self.endpoint).headers(headers).json(body).send().await.map_err(
                |error| {
                    let transient = error.is_timeout() || error.is_connect() || error.is_request();
                    ProviderError { transient, message: error.to_string() }
                },
            )?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let transient = status.as_u16() == 429 || status.is_server_error();
            return Err(ProviderError { transient, message: format!("HTTP {status}: {text}") });
        }

        let parsed: ChatResponse =
            response.json().await.map_err(|error| ProviderError::transient(error.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::permanent("response carried no choices"))
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let mut system = request.system;
        if let Some(schema) = &request.schema {
            system.push_str("\n\nRespond with a single JSON object matching this schema:\n");
            system.push_str(&schema.to_string());
        }

        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: request.prompt },
            ],
            temperature: 0.1,
            response_format: request
                .schema
                .as_ref()
                .map(|_| ResponseFormat { kind: "json_object" }),
        };

        let mut attempt = 0;
        let content = loop {
            match self.send_once(&body).await {
                Ok(content) => break content,
                Err(error) if error.transient && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "agent.llm.retry",
                        purpose = request.purpose.as_str(),
                        attempt,
                        error = %error,
                        "retrying llm completion"
                    );
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                Err(error) => return Err(error),
            }
        };

        if request.schema.is_some() {
            if let Some(value) =
                extract_json(&content).and_then(|json| serde_json::from_str::<Value>(json).ok())
            {
                return Ok(Completion::Structured(value));
            }
        }
        Ok(Completion::Text(content))
    }
}

/// Builds the client for the configured provider.
pub fn client_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, ProviderError> {
    match config.provider {
        LlmProvider::Offline => Ok(Arc::new(OfflineLlm)),
        LlmProvider::OpenAi | LlmProvider::Ollama => {
            Ok(Arc::new(OpenAiCompatibleClient::from_config(config)?))
        }
    }
}

/// Replays canned completions per purpose and records every request.
/// A purpose with no remaining script fails as a permanent provider error.
#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Mutex<HashMap<Purpose, VecDeque<Result<Completion, ProviderError>>>>,
    stalled: Mutex<HashSet<Purpose>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, purpose: Purpose, response: Result<Completion, ProviderError>) -> &Self {
        self.scripts.lock().entry(purpose).or_default().push_back(response);
        self
    }

    pub fn push_json(&self, purpose: Purpose, value: Value) -> &Self {
        self.push(purpose, Ok(Completion::Structured(value)))
    }

    pub fn push_text(&self, purpose: Purpose, text: impl Into<String>) -> &Self {
        self.push(purpose, Ok(Completion::Text(text.into())))
    }

    /// Completions for `purpose` never resolve.
    pub fn stall(&self, purpose: Purpose) -> &Self {
        self.stalled.lock().insert(purpose);
        self
    }

    pub fn requests(&self, purpose: Purpose) -> Vec<CompletionRequest> {
        self.requests.lock().iter().filter(|request| request.purpose == purpose).cloned().collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let purpose = request.purpose;
        self.requests.lock().push(request);
        if self.stalled.lock().contains(&purpose) {
            return std::future::pending().await;
        }
        self.scripts
            .lock()
            .get_mut(&purpose)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(ProviderError::permanent(format!("no scripted {} completion", purpose.as_str())))
            })
    }
}

fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
