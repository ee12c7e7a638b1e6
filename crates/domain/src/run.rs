//! Agent runs — status lifecycle, registry records, and the work-queue
//! request shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::Event;
use crate::mcp::McpServerConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Legal transitions: `queued → running → {completed|failed|stopped}`.
    /// Terminal states are sticky; a transition to the current state is a
    /// permitted no-op.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Queued => matches!(next, Self::Running) || next.is_terminal(),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The persistent record of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Snapshot of the event log, written on terminal transition. The
    /// authoritative replay log lives in the broker until TTL expiry.
    #[serde(default)]
    pub responses: Vec<Event>,
    pub model: String,
    /// The agent configuration the run was started with, frozen at enqueue
    /// time.
    #[serde(default)]
    pub agent_config_snapshot: Value,
}

impl AgentRun {
    pub fn new(run_id: Uuid, thread_id: Uuid, model: impl Into<String>, config: Value) -> Self {
        Self {
            run_id,
            thread_id,
            status: RunStatus::Queued,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            responses: Vec::new(),
            model: model.into(),
            agent_config_snapshot: config,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent configuration & run requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Agent configuration carried by a run request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub system_prompt: String,
    /// Builtin tool toggles, opaque to the core.
    #[serde(default)]
    pub tools: Value,
    #[serde(default)]
    pub mcps: Vec<McpServerConfig>,
    #[serde(default)]
    pub custom_mcps: Vec<McpServerConfig>,
}

impl AgentConfig {
    /// All MCP servers for the run, registry-listed first.
    pub fn all_mcps(&self) -> impl Iterator<Item = &McpServerConfig> {
        self.mcps.iter().chain(self.custom_mcps.iter())
    }
}

/// The message enqueued on the work queue, one per accepted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub instance_id: String,
    #[serde(default)]
    pub account_id: String,
    pub project_id: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_thinking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    pub stream: bool,
    pub enable_context_manager: bool,
    pub agent_config: AgentConfig,
    #[serde(default)]
    pub is_agent_builder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// What a caller submits to the scheduler.
#[derive(Debug, Clone)]
pub struct StartRunRequest {
    pub thread_id: Uuid,
    pub account_id: String,
    pub project_id: String,
    pub model: String,
    pub agent_config: AgentConfig,
    pub enable_thinking: Option<bool>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub stream: bool,
    pub enable_context_manager: bool,
    pub idempotency_key: Option<String>,
}
