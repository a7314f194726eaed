//! [`InternetClient`] – answers `INTERNET_QUERY` requests through an
//! OpenAI-compatible `/v1/chat/completions` endpoint.
//!
//! The hub releases internet queries one at a time (the internet lane only
//! advances after a reply), so [`InternetWorker`] simply handles its inbox in
//! order.
//!
//! # Example
//!
//! ```rust,no_run
//! use bert_runtime::internet::InternetClient;
//!
//! let client = InternetClient::new("http://localhost:11434", "llama3");
//! // let answer = client.ask("How tall is Mount Everest?").await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bert_types::{RequestEnvelope, RequestKind};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// System prompt sent with every question.
pub const SYSTEM_PROMPT: &str = "\
You are the voice of Bert, a small humanoid robot. Answer in one or two short \
spoken sentences without markup. Reply with JSON matching the given schema.";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum InternetError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response could not be understood.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Service seam
// ─────────────────────────────────────────────────────────────────────────────

/// Anything that can answer a free-form question.
#[async_trait]
pub trait InternetService: Send + Sync {
    async fn ask(&self, question: &str) -> Result<String, InternetError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────────────────────────

/// The structured reply the model is asked to produce.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AiReply {
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: Role,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// Extract the spoken answer from the model's message content.  Models that
/// ignore the schema and reply in plain text are accepted as-is.
pub fn parse_answer(content: &str) -> Result<String, InternetError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(InternetError::BadResponse("empty answer".into()));
    }
    match serde_json::from_str::<AiReply>(trimmed) {
        Ok(reply) if !reply.answer.trim().is_empty() => Ok(reply.answer.trim().to_string()),
        Ok(_) => Err(InternetError::BadResponse("empty answer".into())),
        Err(_) => Ok(trimmed.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InternetClient
// ─────────────────────────────────────────────────────────────────────────────

pub struct InternetClient {
    base_url: String,
    model: String,
    api_key: Option<Zeroizing<String>>,
    client: reqwest::Client,
}

impl InternetClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    /// Builder: send `key` as a bearer token.  Empty keys are ignored.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty()).then(|| Zeroizing::new(key));
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request<'a>(&'a self, question: &str) -> ChatRequest<'a> {
        let schema = serde_json::to_value(schema_for!(AiReply)).unwrap_or(serde_json::Value::Null);
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: Role::System, content: SYSTEM_PROMPT.to_string() },
                ChatMessage { role: Role::User, content: question.to_string() },
            ],
            stream: false,
            response_format: ResponseFormat { kind: "json_schema", json_schema: schema },
        }
    }
}

impl std::fmt::Debug for InternetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternetClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", if self.api_key.is_some() { &"<redacted>" } else { &"<not set>" })
            .finish()
    }
}

#[async_trait]
impl InternetService for InternetClient {
    async fn ask(&self, question: &str) -> Result<String, InternetError> {
        let mut request = self.client.post(self.endpoint()).json(&self.request(question));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.as_str());
        }
        let response: ChatResponse = request.send().await?.error_for_status()?.json().await?;

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| InternetError::BadResponse("empty choices array".into()))?;
        if message.role != Role::Assistant {
            debug!(role = ?message.role, "reply not marked as assistant");
        }
        parse_answer(&message.content)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InternetWorker
// ─────────────────────────────────────────────────────────────────────────────

/// Task that answers queries released on the internet lane and hands the
/// results back to the hub.
pub struct InternetWorker {
    service: Arc<dyn InternetService>,
    requests: mpsc::Receiver<RequestEnvelope>,
    replies: mpsc::Sender<RequestEnvelope>,
}

impl InternetWorker {
    /// Returns the worker and the sender the hub queues queries on.
    pub fn new(
        service: Arc<dyn InternetService>,
        replies: mpsc::Sender<RequestEnvelope>,
    ) -> (Self, mpsc::Sender<RequestEnvelope>) {
        let (tx, requests) = mpsc::channel(16);
        (Self { service, requests, replies }, tx)
    }

    pub async fn run(mut self) {
        info!("internet worker started");
        while let Some(mut envelope) = self.requests.recv().await {
            self.answer(&mut envelope).await;
            if self.replies.send(envelope).await.is_err() {
                break;
            }
        }
        info!("internet worker stopped");
    }

    async fn answer(&self, envelope: &mut RequestEnvelope) {
        let RequestKind::InternetQuery(question) = &envelope.kind else {
            envelope.assign_error(format!("The internet cannot answer {}", envelope.kind.label()));
            return;
        };
        match self.service.ask(question).await {
            Ok(answer) => envelope.text = Some(answer),
            Err(e) => {
                warn!(id = %envelope.id, error = %e, "internet query failed");
                envelope.assign_error(format!("I could not reach the internet: {e}"));
            }
        }
    }
}
