//! Chat-completion abstraction and the OpenAI implementation.
//!
//! [`ChatModel`] exposes the two response modes the query pipeline needs:
//! a buffered completion and a [`TextStream`] of fragments.
//! [`OpenAIChat`] implements both against `POST {api_base}/chat/completions`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::config::{Credentials, LlmConfig};
use crate::http::send_with_retry;
use crate::models::{ChatMessage, Role};
use crate::streaming::{spawn_sse_pump, TextStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

/// A message sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }
}

impl From<&ChatMessage> for PromptMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: match message.role {
                Role::User => PromptRole::User,
                Role::Assistant => PromptRole::Assistant,
            },
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Wait for the full completion.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Start a completion and return its fragments as they arrive.
    ///
    /// Errors that happen before the first byte (bad key, unreachable
    /// host) are returned here; later failures arrive as stream items.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream>;
}

pub struct OpenAIChat {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    max_retries: u32,
    idle_timeout: Duration,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig, credentials: &Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        // No whole-request timeout: streams are bounded per fragment.
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            stream_client,
            api_key: credentials.openai_api_key.clone(),
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            max_retries: config.max_retries,
            idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs),
        })
    }

    fn request_body(&self, request: &GenerationRequest, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": stream,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let body = self.request_body(request, false);
        let response = send_with_retry("OpenAI chat", self.max_retries, || {
            self.client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;

        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let body = self.request_body(request, true);
        let response = send_with_retry("OpenAI chat", self.max_retries, || {
            self.stream_client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;

        Ok(spawn_sse_pump(
            response.bytes_stream(),
            self.idle_timeout,
            parse_chat_delta,
        ))
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

/// Extract the text delta from one streamed chunk. Role-only and
/// finish chunks carry no text and yield `None`.
fn parse_chat_delta(data: &str) -> Result<Option<String>> {
    let json: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| anyhow!("Invalid OpenAI stream chunk: {}", e))?;

    if let Some(error) = json.get("error") {
        return Err(anyhow!("OpenAI stream error: {}", error));
    }

    Ok(json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string))
}
