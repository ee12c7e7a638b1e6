//! Context manager — fits thread history into a model-specific token
//! budget via tiered compression.
//!
//! Pure and deterministic: token counts come from a byte-length estimator,
//! no I/O happens here. Compression order is tool results, then user
//! messages, then assistant messages, always sparing the most recent of
//! each; the per-message threshold halves on each pass, and two structural
//! fallbacks (middle-omit, message-count cap) bound the worst case.

use serde_json::Value;
use uuid::Uuid;

use skein_domain::stream::LlmMessage;

/// Estimator: ~4 bytes of serialized content per token.
const BYTES_PER_TOKEN: usize = 4;

/// Fixed per-message overhead (role, framing).
const MESSAGE_OVERHEAD_TOKENS: u64 = 6;

/// Starting per-message compression threshold, halved on each pass.
const DEFAULT_MESSAGE_THRESHOLD: u64 = 4096;

/// Compression passes before falling back to omission.
const MAX_PASSES: u32 = 5;

/// Messages removed per omission batch.
const REMOVAL_BATCH_SIZE: usize = 10;

/// Omission never shrinks the conversation below this.
const MIN_MESSAGES_TO_KEEP: usize = 10;

/// Hard cap on message count, middle-out.
const MAX_MESSAGE_COUNT: usize = 320;

/// Mid-truncation cap for the most recent message of a role.
const SAFE_TRUNCATE_CAP: usize = 100_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budgets & counting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input-token budget per model family.
pub fn token_budget_for(model: &str) -> u64 {
    let model = model.to_lowercase();
    if model.contains("sonnet") || model.contains("claude") {
        108_000
    } else if model.contains("gpt") {
        100_000
    } else if model.contains("gemini") {
        700_000
    } else if model.contains("deepseek") {
        100_000
    } else {
        31_000
    }
}

fn content_string(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn estimate_message_tokens(message: &LlmMessage) -> u64 {
    (message.content_len() / BYTES_PER_TOKEN) as u64 + MESSAGE_OVERHEAD_TOKENS
}

pub fn estimate_tokens(messages: &[LlmMessage]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Single-message compression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Head-truncate to a preview carrying the original's message id, so the
/// model can recover it via `expand_message`.
fn compress_with_reference(content: &Value, message_id: Option<Uuid>, max_len: usize) -> Value {
    let text = content_string(content);
    if text.len() <= max_len {
        return content.clone();
    }
    let id = message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".into());
    let preview: String = text.chars().take(max_len).collect();
    Value::String(format!(
        "{preview}... (truncated)\n\nmessage_id \"{id}\"\nUse expand_message tool to see contents"
    ))
}

/// Mid-truncate: keep head and tail, drop the middle. Used for the most
/// recent message of a role, which must stay mostly intact.
fn safe_truncate(content: &Value, max_len: usize) -> Value {
    let max_len = max_len.min(SAFE_TRUNCATE_CAP);
    let text = content_string(content);
    if text.len() <= max_len {
        return content.clone();
    }
    let keep = max_len.saturating_sub(150);
    let head_len = keep / 2;
    let tail_len = keep - head_len;
    let chars: Vec<char> = text.chars().collect();
    let head: String = chars.iter().take(head_len).collect();
    let tail: String = chars
        .iter()
        .skip(chars.len().saturating_sub(tail_len))
        .collect();
    Value::String(format!(
        "{head}\n\n... (middle truncated) ...\n\n{tail}\n\nThis message is too long; repeat the relevant information in your response to remember it"
    ))
}

/// Strip reconstructable bulk from stored tool executions: the argument
/// bodies already appear in the preceding assistant message.
fn remove_meta_fields(messages: &[LlmMessage]) -> Vec<LlmMessage> {
    messages
        .iter()
        .map(|message| {
            let mut message = message.clone();
            let parsed = match &message.content {
                Value::Object(_) => Some(message.content.clone()),
                Value::String(s) => serde_json::from_str::<Value>(s).ok(),
                _ => None,
            };
            if let Some(Value::Object(mut map)) = parsed {
                if let Some(Value::Object(execution)) = map.get_mut("tool_execution") {
                    execution.remove("arguments");
                    message.content = Value::Object(map);
                }
            }
            message
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ContextManager;

impl ContextManager {
    pub fn new() -> Self {
        Self
    }

    /// Shrink `messages` to fit the model's budget. Input that already
    /// fits comes back unchanged.
    pub fn compress(&self, messages: Vec<LlmMessage>, model: &str) -> Vec<LlmMessage> {
        let budget = token_budget_for(model);
        self.compress_with_threshold(messages, budget, DEFAULT_MESSAGE_THRESHOLD, MAX_PASSES)
    }

    fn compress_with_threshold(
        &self,
        messages: Vec<LlmMessage>,
        budget: u64,
        threshold: u64,
        passes_left: u32,
    ) -> Vec<LlmMessage> {
        let mut result = remove_meta_fields(&messages);

        let before = estimate_tokens(&result);
        if before <= budget {
            return self.cap_message_count(result);
        }

        self.compress_category(&mut result, budget, threshold, LlmMessage::is_tool_result);
        self.compress_category(&mut result, budget, threshold, |m| m.role == "user");
        self.compress_category(&mut result, budget, threshold, |m| m.role == "assistant");

        let after = estimate_tokens(&result);
        tracing::debug!(before, after, budget, "context compression pass");

        if after > budget {
            if passes_left == 0 {
                let omitted = self.omit_middle_messages(result, budget);
                return self.cap_message_count(omitted);
            }
            return self.compress_with_threshold(messages, budget, threshold / 2, passes_left - 1);
        }

        self.cap_message_count(result)
    }

    /// Compress one role category, most recent message spared (it gets a
    /// mid-truncation instead of a preview).
    fn compress_category(
        &self,
        messages: &mut [LlmMessage],
        budget: u64,
        threshold: u64,
        matches: impl Fn(&LlmMessage) -> bool,
    ) {
        if estimate_tokens(messages) <= budget {
            return;
        }
        let mut seen = 0usize;
        for message in messages.iter_mut().rev() {
            if !matches(message) {
                continue;
            }
            seen += 1;
            if estimate_message_tokens(message) <= threshold {
                continue;
            }
            if seen > 1 {
                message.content = compress_with_reference(
                    &message.content,
                    message.message_id,
                    (threshold as usize) * 3,
                );
            } else {
                message.content = safe_truncate(&message.content, (budget as usize) * 2);
            }
        }
    }

    /// Structural fallback: drop batches from the middle of the
    /// conversation, preserving the system message and recent turns.
    fn omit_middle_messages(&self, messages: Vec<LlmMessage>, budget: u64) -> Vec<LlmMessage> {
        if messages.is_empty() {
            return messages;
        }

        let system = messages
            .first()
            .filter(|m| m.role == "system")
            .cloned();
        let mut conversation: Vec<LlmMessage> = if system.is_some() {
            messages[1..].to_vec()
        } else {
            messages
        };

        let assemble = |system: &Option<LlmMessage>, conversation: &[LlmMessage]| {
            let mut all = Vec::with_capacity(conversation.len() + 1);
            if let Some(system) = system {
                all.push(system.clone());
            }
            all.extend_from_slice(conversation);
            all
        };

        let mut safety = 500u32;
        while estimate_tokens(&assemble(&system, &conversation)) > budget && safety > 0 {
            safety -= 1;
            if conversation.len() <= MIN_MESSAGES_TO_KEEP {
                tracing::warn!(
                    remaining = conversation.len(),
                    "cannot omit further, returning oversized context"
                );
                break;
            }
            if conversation.len() > REMOVAL_BATCH_SIZE * 2 {
                let middle_start = conversation.len() / 2 - REMOVAL_BATCH_SIZE / 2;
                conversation.drain(middle_start..middle_start + REMOVAL_BATCH_SIZE);
            } else {
                let to_remove = REMOVAL_BATCH_SIZE.min(conversation.len() / 2);
                if to_remove == 0 {
                    break;
                }
                conversation.drain(..to_remove);
            }
        }

        assemble(&system, &conversation)
    }

    /// Hard cap at [`MAX_MESSAGE_COUNT`], keeping half head, half tail.
    fn cap_message_count(&self, messages: Vec<LlmMessage>) -> Vec<LlmMessage> {
        if messages.len() <= MAX_MESSAGE_COUNT {
            return messages;
        }
        let keep_head = MAX_MESSAGE_COUNT / 2;
        let keep_tail = MAX_MESSAGE_COUNT - keep_head;
        let mut capped = Vec::with_capacity(MAX_MESSAGE_COUNT);
        capped.extend_from_slice(&messages[..keep_head]);
        capped.extend_from_slice(&messages[messages.len() - keep_tail..]);
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> LlmMessage {
        LlmMessage::text(role, content)
    }

    fn msg_with_id(role: &str, content: &str) -> LlmMessage {
        let mut m = LlmMessage::text(role, content);
        m.message_id = Some(Uuid::new_v4());
        m
    }

    fn tool_result_with_id(output: &str) -> LlmMessage {
        let mut m = LlmMessage::new(
            "tool",
            serde_json::json!({
                "tool_execution": {
                    "function_name": "shell",
                    "arguments": { "cmd": "cat big_file" },
                    "result": { "success": true, "output": output }
                }
            }),
        );
        m.message_id = Some(Uuid::new_v4());
        m
    }

    #[test]
    fn budgets_per_family() {
        assert_eq!(token_budget_for("anthropic/claude-sonnet-4"), 108_000);
        assert_eq!(token_budget_for("openai/gpt-4o"), 100_000);
        assert_eq!(token_budget_for("google/gemini-2.5-pro"), 700_000);
        assert_eq!(token_budget_for("deepseek/deepseek-chat"), 100_000);
        assert_eq!(token_budget_for("mistral/mistral-large"), 31_000);
    }

    #[test]
    fn noop_when_already_fitting() {
        let messages = vec![
            msg("system", "be helpful"),
            msg("user", "hello"),
            msg("assistant", "hi there"),
        ];
        let out = ContextManager::new().compress(messages.clone(), "gpt-4o");
        assert_eq!(out.len(), messages.len());
        for (a, b) in out.iter().zip(&messages) {
            assert_eq!(a.content, b.content);
        }
    }

    #[test]
    fn oversized_history_fits_budget_after_compression() {
        let big = "x".repeat(40_000);
        let mut messages = vec![msg("system", "be helpful")];
        for _ in 0..20 {
            messages.push(msg_with_id("user", &big));
            messages.push(msg_with_id("assistant", &big));
            messages.push(tool_result_with_id(&big));
        }
        let out = ContextManager::new().compress(messages, "gpt-4o");
        assert!(estimate_tokens(&out) <= token_budget_for("gpt-4o"));
    }

    #[test]
    fn most_recent_user_and_assistant_survive_verbatim() {
        let big = "y".repeat(30_000);
        let mut messages = vec![msg("system", "be helpful")];
        for _ in 0..15 {
            messages.push(msg_with_id("user", &big));
            messages.push(msg_with_id("assistant", &big));
            messages.push(tool_result_with_id(&big));
        }
        // Recent turns are small enough to stay under the per-message
        // threshold and must come through untouched.
        messages.push(msg_with_id("user", "final question"));
        messages.push(msg_with_id("assistant", "final answer"));

        let out = ContextManager::new().compress(messages, "gpt-4o");
        let last_user = out.iter().rev().find(|m| m.role == "user").unwrap();
        let last_assistant = out.iter().rev().find(|m| m.role == "assistant").unwrap();
        assert_eq!(last_user.content, Value::String("final question".into()));
        assert_eq!(last_assistant.content, Value::String("final answer".into()));
    }

    #[test]
    fn earlier_tool_results_carry_expand_reference() {
        let big = "z".repeat(30_000);
        let mut messages = vec![msg("system", "be helpful")];
        let mut first_tool_id = None;
        for i in 0..15 {
            messages.push(msg_with_id("user", &big));
            let tool = tool_result_with_id(&big);
            if i == 0 {
                first_tool_id = tool.message_id;
            }
            messages.push(tool);
        }

        let out = ContextManager::new().compress(messages, "gpt-4o");
        let reference = first_tool_id.unwrap().to_string();
        let has_reference = out.iter().any(|m| {
            matches!(&m.content, Value::String(s)
                if s.contains("(truncated)") && s.contains(&reference))
        });
        assert!(has_reference, "expected a truncation preview referencing {reference}");
    }

    #[test]
    fn meta_fields_stripped_from_tool_executions() {
        let messages = vec![tool_result_with_id("small output")];
        let out = remove_meta_fields(&messages);
        assert!(out[0].content["tool_execution"].get("arguments").is_none());
        assert_eq!(
            out[0].content["tool_execution"]["result"]["output"],
            "small output"
        );
    }

    #[test]
    fn safe_truncate_keeps_head_and_tail() {
        let text = format!("HEAD{}TAIL", "m".repeat(10_000));
        let out = safe_truncate(&Value::String(text), 2_000);
        let Value::String(s) = out else { panic!("expected string") };
        assert!(s.starts_with("HEAD"));
        assert!(s.contains("(middle truncated)"));
        assert!(s.contains("TAIL"));
        assert!(s.len() < 2_500);
    }

    #[test]
    fn message_count_capped_middle_out() {
        let mut messages = vec![msg("system", "s")];
        for i in 0..500 {
            messages.push(msg("user", &format!("message {i}")));
        }
        let out = ContextManager::new().compress(messages, "gemini-2.5-pro");
        assert_eq!(out.len(), MAX_MESSAGE_COUNT);
        // Head and tail preserved.
        assert_eq!(out[0].role, "system");
        assert_eq!(
            out.last().unwrap().content,
            Value::String("message 499".into())
        );
    }

    #[test]
    fn omission_preserves_system_message() {
        // Messages too large for per-message compression to rescue (every
        // message is small but there are many) force the omission path.
        let mut messages = vec![msg("system", "the system prompt")];
        for i in 0..300 {
            messages.push(msg("user", &format!("filler {i} {}", "w".repeat(600))));
        }
        let manager = ContextManager::new();
        let out = manager.omit_middle_messages(messages, 10_000);
        assert_eq!(out[0].content, Value::String("the system prompt".into()));
        assert!(out.len() < 301);
        // Most recent message survives omission.
        assert!(matches!(&out.last().unwrap().content, Value::String(s) if s.starts_with("filler 299")));
    }
}
