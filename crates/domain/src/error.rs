/// Shared error type used across all skein crates.
///
/// Variants are grouped by handling policy rather than by origin: retryable
/// transport failures, rate limiting (fixed-delay retry), validation and
/// remote-tool failures (surfaced as failed tool results, run continues),
/// user-initiated termination, and fatal errors that fail the run.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Broker, LLM connection or MCP transport failure. Retried with
    /// jittered exponential backoff before it bubbles up.
    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// Provider asked us to slow down. Honor a fixed delay before retry.
    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    /// Transport failures that survived every retry.
    #[error("provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// Malformed tool arguments, unknown tool name, or a config that
    /// violates the provider schema. Surfaced as a failed tool result.
    #[error("validation: {0}")]
    Validation(String),

    /// A tool or MCP server reported failure. Not retried.
    #[error("remote tool error: {0}")]
    RemoteTool(String),

    #[error("run terminated by user")]
    Terminated,

    /// Unhandled failure in the worker or processor: the run transitions
    /// to `failed` and the message is recorded in the registry.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("config: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures worth a retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
