//! The event vocabulary of the resumable run log.
//!
//! Every record appended to `responses:<run_id>` is an [`Event`]. The JSON
//! shape per `type` is pinned here; callers construct events through the
//! typed builders rather than assembling maps, so no two code paths can
//! disagree about a shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tool::{CallSource, ToolCall, ToolExecution};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle values carried by `status` events. `Error` exists only on the
/// event stream; the registry maps it to a `failed` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusValue {
    Running,
    Completed,
    Failed,
    Stopped,
    Error,
}

impl StatusValue {
    /// True when observing this status should end the worker's event loop.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event body (tagged by `type`)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Role + text payload of assistant chunks and finalized assistant
/// messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantContent {
    pub role: String,
    pub content: String,
}

impl AssistantContent {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Wrapper for stored tool executions inside `tool` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    pub tool_execution: ToolExecution,
}

/// Payload of `tool_started` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallAnnouncement {
    pub call_id: String,
    pub function_name: String,
    pub arguments: Value,
    pub source: CallSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    /// One streamed delta of assistant output. `sequence` is monotonic and
    /// contiguous within a single assistant turn.
    AssistantChunk {
        content: AssistantContent,
        sequence: u64,
        message_id: Option<Uuid>,
    },

    /// The finalized assistant message for one turn.
    Assistant {
        content: AssistantContent,
        message_id: Uuid,
    },

    /// A stored tool execution (call + result).
    Tool {
        content: ToolContent,
        message_id: Uuid,
    },

    /// A tool call is about to be dispatched.
    ToolStarted { content: ToolCallAnnouncement },

    /// A tool call finished; carries the full execution record.
    ToolCompleted { content: ToolContent },

    /// Run lifecycle marker.
    Status {
        status: StatusValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },

    /// Marks the assistant's final turn; emitted when a terminal tool ran.
    AssistantResponseEnd { content: Value },

    BrowserState { content: Value },

    ImageContext { content: Value },

    Summary { content: Value },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub body: EventBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    fn new(thread_id: Option<Uuid>, body: EventBody) -> Self {
        Self {
            body,
            thread_id,
            created_at: Utc::now(),
        }
    }

    pub fn assistant_chunk(thread_id: Uuid, sequence: u64, delta: impl Into<String>) -> Self {
        Self::new(
            Some(thread_id),
            EventBody::AssistantChunk {
                content: AssistantContent::new(delta),
                sequence,
                message_id: None,
            },
        )
    }

    pub fn assistant(thread_id: Uuid, message_id: Uuid, content: impl Into<String>) -> Self {
        Self::new(
            Some(thread_id),
            EventBody::Assistant {
                content: AssistantContent::new(content),
                message_id,
            },
        )
    }

    pub fn tool(thread_id: Uuid, message_id: Uuid, execution: ToolExecution) -> Self {
        Self::new(
            Some(thread_id),
            EventBody::Tool {
                content: ToolContent {
                    tool_execution: execution,
                },
                message_id,
            },
        )
    }

    pub fn tool_started(thread_id: Uuid, call: &ToolCall) -> Self {
        Self::new(
            Some(thread_id),
            EventBody::ToolStarted {
                content: ToolCallAnnouncement {
                    call_id: call.id.clone(),
                    function_name: call.function_name.clone(),
                    arguments: call.arguments.clone(),
                    source: call.source,
                },
            },
        )
    }

    pub fn tool_completed(thread_id: Uuid, execution: ToolExecution) -> Self {
        Self::new(
            Some(thread_id),
            EventBody::ToolCompleted {
                content: ToolContent {
                    tool_execution: execution,
                },
            },
        )
    }

    pub fn status(thread_id: Option<Uuid>, status: StatusValue) -> Self {
        Self::new(
            thread_id,
            EventBody::Status {
                status,
                message: None,
                finish_reason: None,
            },
        )
    }

    pub fn status_with_message(
        thread_id: Option<Uuid>,
        status: StatusValue,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            thread_id,
            EventBody::Status {
                status,
                message: Some(message.into()),
                finish_reason: None,
            },
        )
    }

    pub fn finish(thread_id: Uuid, finish_reason: impl Into<String>) -> Self {
        Self::new(
            Some(thread_id),
            EventBody::Status {
                status: StatusValue::Running,
                message: None,
                finish_reason: Some(finish_reason.into()),
            },
        )
    }

    pub fn assistant_response_end(thread_id: Uuid, content: Value) -> Self {
        Self::new(Some(thread_id), EventBody::AssistantResponseEnd { content })
    }

    pub fn summary(thread_id: Uuid, content: Value) -> Self {
        Self::new(Some(thread_id), EventBody::Summary { content })
    }

    pub fn browser_state(thread_id: Uuid, content: Value) -> Self {
        Self::new(Some(thread_id), EventBody::BrowserState { content })
    }

    pub fn image_context(thread_id: Uuid, content: Value) -> Self {
        Self::new(Some(thread_id), EventBody::ImageContext { content })
    }

    /// The terminal status carried by this event, if any. The worker uses
    /// this to decide the run's final state.
    pub fn terminal_status(&self) -> Option<StatusValue> {
        match &self.body {
            EventBody::Status { status, .. } if status.is_terminal() => Some(*status),
            _ => None,
        }
    }

    pub fn is_status(&self) -> bool {
        matches!(self.body, EventBody::Status { .. })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sentinels published on the per-run control and notification channels.
pub mod control {
    /// Published on `new_event:<run_id>` after every append.
    pub const NEW_EVENT: &str = "new";
    /// Run completed normally.
    pub const END_STREAM: &str = "END_STREAM";
    /// Run failed.
    pub const ERROR: &str = "ERROR";
    /// Run stopped by user request.
    pub const STOP: &str = "STOP";

    /// True for the three tokens that end a subscriber's stream.
    pub fn is_terminal(token: &str) -> bool {
        matches!(token, END_STREAM | ERROR | STOP)
    }
}
