//! Request/response types and the client trait.

use serde_json::Value;

use skein_domain::run::ReasoningEffort;
use skein_domain::stream::{BoxStream, LlmChunk, LlmMessage, Usage};
use skein_domain::Result;

/// How the model may use tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

impl ToolChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::None => "none",
            Self::Required => "required",
        }
    }
}

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Prepared conversation, system prompt first.
    pub messages: Vec<LlmMessage>,
    pub model: String,
    /// OpenAPI function declarations from the tool registry.
    pub tools: Vec<Value>,
    pub tool_choice: ToolChoice,
    /// Sampling temperature. `None` lets the provider choose; per-model
    /// transforms may strip it for models that reject overrides.
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub enable_thinking: bool,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// A complete (non-streaming) response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    /// Raw provider tool calls, already assembled.
    pub tool_calls: Vec<Value>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    pub model: String,
}

/// The seam to an LLM provider.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Stream a completion as [`LlmChunk`]s.
    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<LlmChunk>>>;

    /// Request a complete response in one round trip.
    async fn complete(&self, req: ChatRequest) -> Result<ChatResponse>;

    fn provider_id(&self) -> &str;
}
