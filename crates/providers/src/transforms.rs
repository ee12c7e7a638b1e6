//! Per-model request transforms.
//!
//! Provider quirks live here as transforms on the request record, not as
//! special cases at call sites: alias resolution, parameter restrictions,
//! reasoning-effort mapping, and the prompt-cache marker hook.

use serde_json::Value;

use skein_domain::stream::LlmMessage;

use crate::traits::ChatRequest;

/// Short model names accepted on run requests, resolved before the run
/// starts. Unknown names pass through unchanged.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("sonnet", "anthropic/claude-sonnet-4-20250514"),
    ("haiku", "anthropic/claude-3-5-haiku-latest"),
    ("gpt-4o", "openai/gpt-4o"),
    ("gpt-4o-mini", "openai/gpt-4o-mini"),
    ("gpt-4.1", "openai/gpt-4.1"),
    ("o3", "openai/o3"),
    ("deepseek", "deepseek/deepseek-chat"),
    ("deepseek-r1", "deepseek/deepseek-reasoner"),
    ("gemini-flash", "google/gemini-2.5-flash"),
    ("gemini-pro", "google/gemini-2.5-pro"),
];

pub fn resolve_model_alias(name: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, resolved)| *resolved)
        .unwrap_or(name)
}

/// Strip the provider prefix (`openai/gpt-4o` → `gpt-4o`) for wire formats
/// that want the bare model id.
pub fn bare_model_name(name: &str) -> &str {
    name.rsplit_once('/').map(|(_, bare)| bare).unwrap_or(name)
}

/// Reasoning models reject sampling overrides; some families reserve the
/// reasoning-effort field. Applied to every request before dispatch.
pub fn apply_model_quirks(mut req: ChatRequest) -> ChatRequest {
    let bare = bare_model_name(&req.model).to_lowercase();

    // o-series and reasoner models only accept default temperature.
    let fixed_temperature = bare.starts_with("o1")
        || bare.starts_with("o3")
        || bare.starts_with("o4")
        || bare.contains("reasoner");
    if fixed_temperature {
        req.temperature = None;
    }

    // reasoning_effort is an o-series parameter; other families get the
    // thinking toggle instead.
    if req.reasoning_effort.is_some() && !bare.starts_with('o') {
        req.reasoning_effort = None;
    }

    req
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt-cache marker hook
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Annotates messages with provider cache-control markers. Best-effort:
/// marker placement may vary across retries and providers are free to
/// ignore it.
pub trait CacheMarker: Send + Sync {
    fn mark(&self, messages: &mut [LlmMessage]);
}

/// No markers.
pub struct NoopCacheMarker;

impl CacheMarker for NoopCacheMarker {
    fn mark(&self, _messages: &mut [LlmMessage]) {}
}

/// Anthropic-style marker: flags the first few large text blocks as
/// cacheable.
pub struct AnthropicPromptCache {
    max_marks: usize,
}

impl Default for AnthropicPromptCache {
    fn default() -> Self {
        Self { max_marks: 3 }
    }
}

impl CacheMarker for AnthropicPromptCache {
    fn mark(&self, messages: &mut [LlmMessage]) {
        let mut marked = 0;
        for message in messages.iter_mut() {
            if marked >= self.max_marks {
                break;
            }
            match &mut message.content {
                Value::Object(map) => {
                    map.insert(
                        "cache_control".into(),
                        serde_json::json!({ "type": "ephemeral" }),
                    );
                    marked += 1;
                }
                Value::String(text) => {
                    let content = serde_json::json!([{
                        "type": "text",
                        "text": text,
                        "cache_control": { "type": "ephemeral" },
                    }]);
                    message.content = content;
                    marked += 1;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolution_is_total() {
        assert_eq!(resolve_model_alias("sonnet"), "anthropic/claude-sonnet-4-20250514");
        assert_eq!(resolve_model_alias("gpt-4o"), "openai/gpt-4o");
        // Unknown names pass through unchanged.
        assert_eq!(resolve_model_alias("my-custom/model"), "my-custom/model");
    }

    #[test]
    fn o_series_loses_temperature() {
        let req = ChatRequest {
            model: "openai/o3".into(),
            temperature: Some(0.7),
            reasoning_effort: Some(skein_domain::run::ReasoningEffort::High),
            ..Default::default()
        };
        let out = apply_model_quirks(req);
        assert!(out.temperature.is_none());
        assert!(out.reasoning_effort.is_some());
    }

    #[test]
    fn non_reasoning_model_keeps_temperature_drops_effort() {
        let req = ChatRequest {
            model: "openai/gpt-4o".into(),
            temperature: Some(0.2),
            reasoning_effort: Some(skein_domain::run::ReasoningEffort::Low),
            ..Default::default()
        };
        let out = apply_model_quirks(req);
        assert_eq!(out.temperature, Some(0.2));
        assert!(out.reasoning_effort.is_none());
    }

    #[test]
    fn cache_marker_flags_first_blocks() {
        let mut messages = vec![
            LlmMessage::text("system", "you are helpful"),
            LlmMessage::text("user", "hi"),
            LlmMessage::text("assistant", "hello"),
            LlmMessage::text("user", "another"),
        ];
        AnthropicPromptCache::default().mark(&mut messages);

        let marked = messages
            .iter()
            .filter(|m| {
                m.content
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(|b| b.get("cache_control"))
                    .is_some()
            })
            .count();
        assert_eq!(marked, 3);
        // The fourth message is untouched.
        assert!(messages[3].content.is_string());
    }
}
