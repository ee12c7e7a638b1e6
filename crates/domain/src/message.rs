//! Thread messages — the append-only conversation history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The closed set of message types a thread may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    AssistantResponseEnd,
    Tool,
    Status,
    Summary,
    BrowserState,
    ImageContext,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::AssistantResponseEnd => "assistant_response_end",
            Self::Tool => "tool",
            Self::Status => "status",
            Self::Summary => "summary",
            Self::BrowserState => "browser_state",
            Self::ImageContext => "image_context",
        }
    }
}

/// One message in a thread. Content is structured but opaque to the
/// runtime; the only requirement is that it round-trips as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Whether this message is part of the LLM conversation (as opposed to
    /// bookkeeping rows like `status`).
    pub is_llm_message: bool,
    pub content: Value,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Extract the conversational role from the content, if present.
    pub fn role(&self) -> Option<&str> {
        self.content.get("role").and_then(Value::as_str)
    }
}
