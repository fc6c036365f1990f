//! LLM adapter (C5): single-turn `create` (with tools) and `stream_text`,
//! with a primary→fallback model retry, a wall-clock deadline, and usage
//! accounting.
//!
//! Mirrors the provider-adapter idiom used elsewhere in this crate's LLM
//! integrations (a trait normalizing vendor streaming APIs to one event
//! model, plus a thin fallback wrapper) rather than hard-wiring a vendor
//! SDK — per the distilled spec, concrete LLM vendors are behind this
//! trait only.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

/// Who sent a message in the conversation passed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One block of message content. Assistant messages normalize to a list
/// of these so tool-iteration turns can replay prior assistant output
/// (text and tool calls) as context, per §4.5.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { media_type: String, data_base64: String },
    ToolUse { call_id: String, name: String, arguments: serde_json::Value },
    ToolResult { call_id: String, content: String, is_error: bool },
}

/// A single message in the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user_with_image(
        text: impl Into<String>,
        media_type: impl Into<String>,
        data_base64: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::User,
            content: vec![
                ContentBlock::Text { text: text.into() },
                ContentBlock::Image {
                    media_type: media_type.into(),
                    data_base64: data_base64.into(),
                },
            ],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                is_error,
            }],
        }
    }
}

/// A tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Generation parameters for a single request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub max_tokens: usize,
    pub temperature: f64,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_tokens: 600,
            temperature: 0.2,
        }
    }
}

/// A normalized streaming event from an LLM provider.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    TextDelta { text: String },
    ToolCallStart { call_id: String, name: String },
    ToolCallArgsDelta { call_id: String, fragment: String },
    ToolCallEnd { call_id: String },
    StreamEnd { finish_reason: FinishReason },
    StreamError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Cancelled,
    Other,
}

pub type LlmEventStream = Pin<Box<dyn Stream<Item = LlmEvent> + Send>>;

/// Errors from the LLM adapter layer. Transport/timeout/5xx errors are
/// retryable (triggering the fallback model); others are not.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm request timed out: {0}")]
    Timeout(String),
    #[error("llm provider error: {0}")]
    Provider(String),
    #[error("llm auth/config error: {0}")]
    Config(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_) | Self::Provider(_))
    }
}

/// Vendor-agnostic provider adapter. Concrete implementations wrap a real
/// vendor SDK/HTTP client; tests use an in-memory double.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        messages: &[Message],
        options: &RequestOptions,
        tools: &[ToolDefinition],
    ) -> Result<LlmEventStream, LlmError>;
}

/// Token usage for a single request. Fields default to 0 on absence
/// (providers that don't report usage), per §4.5.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Outcome of a `create`/`stream_text` call.
#[derive(Debug, Clone)]
pub struct LlmResult {
    pub text: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub request_id: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

/// Drains an event stream into an [`LlmResult`], forwarding text deltas to
/// `on_delta` as they arrive (used by both `create` and `stream_text` —
/// `create` simply passes a no-op sink since tool-loop turns don't stream
/// per §4.7 step 5).
async fn drain(
    mut stream: LlmEventStream,
    model: &str,
    request_id: &str,
    mut on_delta: impl FnMut(&str),
) -> Result<LlmResult, LlmError> {
    let mut text = String::new();
    let mut content = Vec::new();
    let mut finish_reason = FinishReason::Other;
    let mut open_tool: Option<(String, String, String)> = None; // (call_id, name, args_buf)

    while let Some(event) = stream.next().await {
        match event {
            LlmEvent::TextDelta { text: delta } => {
                on_delta(&delta);
                text.push_str(&delta);
            }
            LlmEvent::ToolCallStart { call_id, name } => {
                open_tool = Some((call_id, name, String::new()));
            }
            LlmEvent::ToolCallArgsDelta { call_id, fragment } => {
                if let Some((id, _, buf)) = open_tool.as_mut() {
                    if *id == call_id {
                        buf.push_str(&fragment);
                    }
                }
            }
            LlmEvent::ToolCallEnd { call_id } => {
                if let Some((id, name, buf)) = open_tool.take() {
                    if id == call_id {
                        let arguments = serde_json::from_str(&buf)
                            .unwrap_or(serde_json::Value::Object(Default::default()));
                        content.push(ContentBlock::ToolUse {
                            call_id: id,
                            name,
                            arguments,
                        });
                    }
                }
            }
            LlmEvent::StreamEnd { finish_reason: fr } => {
                finish_reason = fr;
            }
            LlmEvent::StreamError { message } => {
                return Err(LlmError::Provider(message));
            }
        }
    }
    if !text.is_empty() {
        content.insert(0, ContentBlock::Text { text: text.clone() });
    }
    Ok(LlmResult {
        text,
        content,
        model: model.to_string(),
        request_id: request_id.to_string(),
        usage: Usage::default(),
        finish_reason,
    })
}

/// The LLM adapter: primary model with one retry against a fallback model
/// on a retryable error, bounded by a wall-clock deadline (§4.5).
pub struct LlmAdapter {
    primary: Arc<dyn LlmProvider>,
    fallback: Arc<dyn LlmProvider>,
    request_timeout: Duration,
}

impl LlmAdapter {
    pub fn new(primary: Arc<dyn LlmProvider>, fallback: Arc<dyn LlmProvider>, request_timeout: Duration) -> Self {
        Self {
            primary,
            fallback,
            request_timeout,
        }
    }

    async fn send_with_fallback(
        &self,
        messages: &[Message],
        options: &RequestOptions,
        tools: &[ToolDefinition],
    ) -> Result<(LlmEventStream, &str), LlmError> {
        match tokio::time::timeout(self.request_timeout, self.primary.send(messages, options, tools)).await {
            Ok(Ok(stream)) => Ok((stream, self.primary.name())),
            Ok(Err(e)) if e.is_retryable() => {
                tracing::warn!(error = %e, primary = self.primary.name(), fallback = self.fallback.name(), "primary LLM failed, retrying on fallback model");
                let stream = tokio::time::timeout(
                    self.request_timeout,
                    self.fallback.send(messages, options, tools),
                )
                .await
                .map_err(|_| LlmError::Timeout(format!("fallback model exceeded {:?}", self.request_timeout)))??;
                Ok((stream, self.fallback.name()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LlmError::Timeout(format!(
                "primary model exceeded {:?}",
                self.request_timeout
            ))),
        }
    }

    /// Single-turn request, tools offered. Does not stream: the caller
    /// (the tool loop) needs the whole response to decide on tool_use
    /// blocks before continuing, per §4.7 step 5.
    pub async fn create(
        &self,
        messages: &[Message],
        options: &RequestOptions,
        tools: &[ToolDefinition],
    ) -> Result<LlmResult, LlmError> {
        let (stream, model) = self.send_with_fallback(messages, options, tools).await?;
        let request_id = uuid::Uuid::new_v4().to_string();
        drain(stream, model, &request_id, |_| {}).await
    }

    /// Streaming request with no tools offered; `on_delta` receives each
    /// text fragment as it arrives, per §4.7 step 6.
    pub async fn stream_text(
        &self,
        messages: &[Message],
        options: &RequestOptions,
        on_delta: impl FnMut(&str),
    ) -> Result<LlmResult, LlmError> {
        let (stream, model) = self.send_with_fallback(messages, options, &[]).await?;
        let request_id = uuid::Uuid::new_v4().to_string();
        drain(stream, model, &request_id, on_delta).await
    }
}
