//! LLM provider abstraction.
//!
//! The runtime talks to models through [`LlmClient`]; the bundled adapter
//! speaks the OpenAI chat-completions wire format, which covers OpenAI,
//! Azure, OpenRouter, and the common self-hosted servers. Retry and
//! rate-limit policy wraps any client via [`ResilientClient`].

pub mod openai_compat;
pub mod resilient;
pub mod traits;
pub mod transforms;

pub use openai_compat::OpenAiCompatClient;
pub use resilient::ResilientClient;
pub use traits::{ChatRequest, ChatResponse, LlmClient, ToolChoice};
pub use transforms::{resolve_model_alias, AnthropicPromptCache, CacheMarker, NoopCacheMarker};
