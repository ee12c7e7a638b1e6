//! Builtin tools the core itself depends on.
//!
//! Heavier builtins (shell, file ops, browser) live with the sandbox layer
//! and register through the same interface; the three here are part of the
//! run lifecycle: `ask` and `complete` terminate a run, `expand_message`
//! recovers content the context manager compressed away.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use skein_domain::store::MessageStore;
use skein_domain::tool::{
    ParamCoercion, ToolResult, ToolSchema, XmlBindings, XmlParamBinding,
};
use skein_domain::{Error, Result};

use crate::registry::{ToolDispatcher, ToolRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ask / complete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `ask` — surface a question to the user and pause the run for input.
pub struct AskTool;

#[async_trait]
impl ToolDispatcher for AskTool {
    async fn dispatch(&self, arguments: Value) -> Result<ToolResult> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("ask requires a 'text' argument".into()))?;
        Ok(ToolResult::ok(serde_json::json!({
            "question": text,
            "attachments": arguments.get("attachments").cloned().unwrap_or(Value::Null),
        })))
    }
}

pub fn ask_schema() -> ToolSchema {
    ToolSchema::builtin(
        "ask",
        "Ask the user a question and wait for their input. Ends the current run.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "The question to ask" },
                "attachments": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Optional file paths to show alongside the question"
                }
            },
            "required": ["text"]
        }),
    )
    .terminal()
    .with_xml(XmlBindings {
        tag_name: "ask".into(),
        params: vec![XmlParamBinding {
            name: "text".into(),
            required: true,
            coercion: ParamCoercion::String,
        }],
    })
}

/// `complete` — declare the task finished. Ends the run successfully.
pub struct CompleteTool;

#[async_trait]
impl ToolDispatcher for CompleteTool {
    async fn dispatch(&self, arguments: Value) -> Result<ToolResult> {
        Ok(ToolResult::ok(serde_json::json!({
            "summary": arguments.get("text").cloned().unwrap_or(Value::Null),
        })))
    }
}

pub fn complete_schema() -> ToolSchema {
    ToolSchema::builtin(
        "complete",
        "Declare the task complete. Ends the current run.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "A short completion summary" }
            }
        }),
    )
    .terminal()
    .with_xml(XmlBindings {
        tag_name: "complete".into(),
        params: vec![XmlParamBinding {
            name: "text".into(),
            required: false,
            coercion: ParamCoercion::String,
        }],
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// expand_message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `expand_message` — fetch the full content of a message the context
/// manager replaced with a truncation preview.
pub struct ExpandMessageTool {
    store: Arc<dyn MessageStore>,
}

impl ExpandMessageTool {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolDispatcher for ExpandMessageTool {
    async fn dispatch(&self, arguments: Value) -> Result<ToolResult> {
        let raw_id = arguments
            .get("message_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("expand_message requires 'message_id'".into()))?;
        let message_id = Uuid::parse_str(raw_id)
            .map_err(|e| Error::Validation(format!("invalid message_id: {e}")))?;

        match self.store.get_message(message_id).await? {
            Some(message) => Ok(ToolResult::ok(message.content)),
            None => Ok(ToolResult::failed(format!(
                "message {message_id} not found or expired"
            ))),
        }
    }
}

pub fn expand_message_schema() -> ToolSchema {
    ToolSchema::builtin(
        "expand_message",
        "Retrieve the full content of a message that was truncated in the conversation history.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "message_id": { "type": "string", "description": "The id referenced by the truncation notice" }
            },
            "required": ["message_id"]
        }),
    )
    .with_xml(XmlBindings {
        tag_name: "expand-message".into(),
        params: vec![XmlParamBinding {
            name: "message_id".into(),
            required: true,
            coercion: ParamCoercion::String,
        }],
    })
}

/// Register the lifecycle builtins on a fresh registry.
pub fn register_lifecycle_tools(registry: &ToolRegistry, store: Arc<dyn MessageStore>) {
    registry.register(ask_schema(), Arc::new(AskTool));
    registry.register(complete_schema(), Arc::new(CompleteTool));
    registry.register(
        expand_message_schema(),
        Arc::new(ExpandMessageTool::new(store)),
    );
}
