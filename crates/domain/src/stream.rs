//! Provider-agnostic LLM streaming types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One message in the prepared LLM conversation. The content shape is
/// whatever the context manager produced; providers serialize it as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: Value,
    /// Carried through compression so previews can reference the original.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<uuid::Uuid>,
}

impl LlmMessage {
    pub fn new(role: impl Into<String>, content: Value) -> Self {
        Self {
            role: role.into(),
            content,
            message_id: None,
        }
    }

    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(role, Value::String(content.into()))
    }

    /// Byte length of the content as serialized for the provider.
    pub fn content_len(&self) -> usize {
        match &self.content {
            Value::String(s) => s.len(),
            other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
        }
    }

    /// True when this message carries a stored tool execution: the `tool`
    /// role, or content wrapping a `tool_execution` record (possibly
    /// JSON-encoded as a string). The context manager compresses these
    /// first.
    pub fn is_tool_result(&self) -> bool {
        if self.role == "tool" {
            return true;
        }
        match &self.content {
            Value::Object(map) => map.contains_key("tool_execution"),
            Value::String(s) if s.contains("tool_execution") => {
                serde_json::from_str::<Value>(s)
                    .map(|v| v.get("tool_execution").is_some())
                    .unwrap_or(false)
            }
            _ => false,
        }
    }
}

/// Events emitted while streaming a completion.
///
/// Providers translate their wire format into this enum; the response
/// processor consumes it without knowing which provider produced it.
#[derive(Debug, Clone)]
pub enum LlmChunk {
    /// Reasoning/thinking content, when the model emits it separately.
    Thinking { text: String },

    /// A delta of assistant text.
    Delta { text: String },

    /// A native tool call has started.
    ToolCallStarted { index: u32, call_id: String, function_name: String },

    /// Incremental native tool-call argument JSON.
    ToolCallDelta { index: u32, delta: String },

    /// The stream finished.
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_len_counts_serialized_structured_content() {
        let text = LlmMessage::text("user", "hello");
        assert_eq!(text.content_len(), 5);

        let structured = LlmMessage::new("tool", serde_json::json!({ "a": 1 }));
        assert_eq!(structured.content_len(), r#"{"a":1}"#.len());
    }

    #[test]
    fn tool_result_detection() {
        assert!(LlmMessage::text("tool", "anything").is_tool_result());
        assert!(LlmMessage::new(
            "user",
            serde_json::json!({ "tool_execution": { "function_name": "shell" } })
        )
        .is_tool_result());
        assert!(LlmMessage::text(
            "user",
            r#"{"tool_execution":{"function_name":"shell"}}"#
        )
        .is_tool_result());
        // Mentioning the key in prose is not a tool result.
        assert!(!LlmMessage::text("user", "talk about tool_execution records").is_tool_result());
        assert!(!LlmMessage::text("assistant", "plain reply").is_tool_result());
    }
}
