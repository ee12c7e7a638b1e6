//! MCP server configuration — one tagged variant per transport.
//!
//! Connections are value-like: nothing here holds a live session. A
//! per-variant resolver in the client pool turns a config into
//! `(url, headers)` or a subprocess spec; the common client drives the
//! JSON-RPC session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Transport-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpTransportConfig {
    /// Streaming HTTP: JSON-RPC POSTed to `url`, responses arrive as JSON
    /// or as an SSE body.
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Plain HTTP + SSE.
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Local subprocess speaking newline-delimited JSON-RPC on stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },

    /// Composio-hosted server: the profile id is exchanged for a signed URL.
    Composio { profile_id: String },

    /// Pipedream-hosted server: fixed endpoint, OAuth bearer plus `x-pd-*`
    /// headers derived from the profile.
    Pipedream {
        app_slug: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        profile_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        external_user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        oauth_app_id: Option<String>,
    },
}

impl McpTransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StreamableHttp { .. } => "streamable_http",
            Self::Sse { .. } => "sse",
            Self::Stdio { .. } => "stdio",
            Self::Composio { .. } => "composio",
            Self::Pipedream { .. } => "pipedream",
        }
    }
}

/// One configured MCP server for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Stable identifier, also the namespace prefix for its tools.
    pub qualified_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(flatten)]
    pub transport: McpTransportConfig,
    /// Tools the agent config allows. Empty means "all discovered tools".
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
}

impl McpServerConfig {
    /// Whether a discovered tool may be dispatched under this config.
    pub fn tool_enabled(&self, tool_name: &str) -> bool {
        self.enabled_tools.is_empty() || self.enabled_tools.iter().any(|t| t == tool_name)
    }
}
