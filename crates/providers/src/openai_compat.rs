//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Azure, OpenRouter and the self-hosted servers that
//! follow the chat-completions contract.

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::Value;

use skein_domain::stream::{BoxStream, LlmChunk, Usage};
use skein_domain::{Error, Result};

use crate::traits::{ChatRequest, ChatResponse, LlmClient, ToolChoice};
use crate::transforms::{apply_model_quirks, bare_model_name, CacheMarker, NoopCacheMarker};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatClient {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    cache_marker: Box<dyn CacheMarker>,
}

impl OpenAiCompatClient {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Transport(format!("http client: {e}")))?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            cache_marker: Box::new(NoopCacheMarker),
        })
    }

    /// Install a prompt-cache marker hook (best-effort optimization).
    pub fn with_cache_marker(mut self, marker: Box<dyn CacheMarker>) -> Self {
        self.cache_marker = marker;
        self
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut req = apply_model_quirks(req.clone());
        self.cache_marker.mark(&mut req.messages);

        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role,
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": bare_model_name(&req.model),
            "messages": messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.clone());
            if req.tool_choice != ToolChoice::Auto {
                body["tool_choice"] = Value::String(req.tool_choice.as_str().into());
            }
        }
        if let Some(temperature) = req.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(effort) = req.reasoning_effort {
            body["reasoning_effort"] = serde_json::to_value(effort).unwrap_or(Value::Null);
        }
        body
    }

    /// Map an HTTP error status to the retry taxonomy.
    fn status_error(&self, status: reqwest::StatusCode, body: String) -> Error {
        if status.as_u16() == 429 {
            return Error::RateLimited {
                provider: self.id.clone(),
            };
        }
        if status.is_server_error() || status.as_u16() == 408 {
            return Error::Transport(format!("{}: HTTP {status} - {body}", self.id));
        }
        Error::ProviderUnavailable {
            provider: self.id.clone(),
            message: format!("HTTP {status} - {body}"),
        }
    }
}

fn from_reqwest(provider: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{provider}: {e}"))
    } else {
        Error::Transport(format!("{provider}: {e}"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE chunk parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

/// Parse one SSE `data:` payload into chunks. `[DONE]` closes the stream;
/// a data frame may carry several logical chunks (tool call start + args).
fn parse_sse_data(data: &str) -> Vec<Result<LlmChunk>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(LlmChunk::Done {
            usage: None,
            finish_reason: None,
        })];
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first());

    let Some(choice) = choice else {
        // Usage-only frame (stream_options.include_usage).
        if let Some(usage) = v.get("usage").and_then(parse_usage) {
            return vec![Ok(LlmChunk::Done {
                usage: Some(usage),
                finish_reason: None,
            })];
        }
        return Vec::new();
    };

    let mut chunks = Vec::new();
    let delta = choice.get("delta").unwrap_or(&Value::Null);

    if let Some(text) = delta.get("reasoning_content").and_then(Value::as_str) {
        if !text.is_empty() {
            chunks.push(Ok(LlmChunk::Thinking { text: text.into() }));
        }
    }

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            chunks.push(Ok(LlmChunk::Delta { text: text.into() }));
        }
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for tc in tool_calls {
            let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
            if let Some(id) = tc.get("id").and_then(Value::as_str) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                chunks.push(Ok(LlmChunk::ToolCallStarted {
                    index,
                    call_id: id.into(),
                    function_name: name.into(),
                }));
            }
            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
            {
                if !args.is_empty() {
                    chunks.push(Ok(LlmChunk::ToolCallDelta {
                        index,
                        delta: args.into(),
                    }));
                }
            }
        }
    }

    if let Some(finish_reason) = choice.get("finish_reason").and_then(Value::as_str) {
        chunks.push(Ok(LlmChunk::Done {
            usage: v.get("usage").and_then(parse_usage),
            finish_reason: Some(finish_reason.into()),
        }));
    }

    chunks
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<LlmChunk>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, model = %req.model, "llm stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| from_reqwest(&self.id, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(self.status_error(status, text));
        }

        let mut events = resp.bytes_stream().eventsource();
        Ok(Box::pin(async_stream_chunks(move |tx| async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        for chunk in parse_sse_data(&event.data) {
                            let done = matches!(chunk, Ok(LlmChunk::Done { .. }));
                            if tx.send(chunk).is_err() || done {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Error::Transport(format!(
                            "{provider_id}: stream read: {e}"
                        ))));
                        return;
                    }
                }
            }
        })))
    }

    async fn complete(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req, false);

        tracing::debug!(provider = %self.id, model = %req.model, "llm complete request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| from_reqwest(&self.id, e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| from_reqwest(&self.id, e))?;
        if !status.is_success() {
            return Err(self.status_error(status, text));
        }

        let v: Value = serde_json::from_str(&text)?;
        let choice = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .ok_or_else(|| Error::Other(format!("{}: response has no choices", self.id)))?;
        let message = choice.get("message").unwrap_or(&Value::Null);

        Ok(ChatResponse {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_calls: message
                .get("tool_calls")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            usage: v.get("usage").and_then(parse_usage),
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(String::from),
            model: v
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&req.model)
                .to_string(),
        })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

/// Bridge a producer closure onto an mpsc-backed stream. Keeps the SSE
/// decode loop readable without hand-rolling a `Stream` impl.
fn async_stream_chunks<F, Fut>(
    producer: F,
) -> impl futures_util::Stream<Item = Result<LlmChunk>> + Send
where
    F: FnOnce(tokio::sync::mpsc::UnboundedSender<Result<LlmChunk>>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(producer(tx));
    futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx))
}
