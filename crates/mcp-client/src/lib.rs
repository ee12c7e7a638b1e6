//! MCP client pool — connects to heterogeneous MCP servers, caches tool
//! catalogs, and dispatches tool calls behind a uniform interface.
//!
//! Sessions are not held between invocations: every call opens a
//! transport, initializes, runs one request, and closes. Short-lived auth
//! makes re-establishment cheaper than keep-alive, and it removes stale-
//! session bugs entirely. Catalog discovery is the only per-server cost,
//! amortized by a broker-backed schema cache.

pub mod endpoint;
pub mod pool;
pub mod protocol;
pub mod transport;

pub use endpoint::{ComposioProfileService, PipedreamTokenService};
pub use pool::{McpClientPool, McpInvocation, McpToolCatalog};
pub use protocol::{McpToolDef, ToolCallOutcome};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error taxonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors raised to the response processor. `Transport` and `Timeout` are
/// retried with jittered backoff; the rest surface immediately.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Unknown tool, or a tool disabled by the run's config.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// Argument validation failed before dispatch.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Network or subprocess failure.
    #[error("transport: {0}")]
    Transport(String),

    /// The server completed the call but flagged `isError`.
    #[error("remote tool error: {0}")]
    Remote(String),

    /// Per-call deadline exceeded.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Handshake or message-shape violation; not retried.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl McpError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

impl From<McpError> for skein_domain::Error {
    fn from(e: McpError) -> Self {
        match e {
            McpError::NotFound(t) => skein_domain::Error::NotFound(t),
            McpError::InvalidArgs(m) => skein_domain::Error::Validation(m),
            McpError::Transport(m) => skein_domain::Error::Transport(m),
            McpError::Remote(m) => skein_domain::Error::RemoteTool(m),
            McpError::Timeout(d) => skein_domain::Error::Timeout(format!("mcp call ({d:?})")),
            McpError::Protocol(m) => skein_domain::Error::Other(m),
        }
    }
}
