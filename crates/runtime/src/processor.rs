//! Response processor — consumes an LLM chunk stream, interleaves tool
//! execution, and emits structured events.
//!
//! The processor is single-threaded cooperative: one driver task owns the
//! chunk loop, the XML parser state, and native tool-call assembly. Tool
//! dispatch fans out only under the `parallel` strategy, and even then
//! completions are buffered back into call order before they are emitted.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use skein_domain::event::{Event, StatusValue};
use skein_domain::message::MessageType;
use skein_domain::store::MessageStore;
use skein_domain::stream::{BoxStream, LlmChunk};
use skein_domain::tool::{CallSource, ToolCall, ToolExecution, ToolResult};
use skein_tools::ToolRegistry;

use crate::cancel::CancelToken;
use crate::xml_parser::StreamingXmlParser;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordering among multiple tool calls in one assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Parse XML invocations out of streamed text.
    pub xml_tool_calling: bool,
    /// Honor provider-native `tool_calls` fields.
    pub native_tool_calling: bool,
    /// When false, calls are surfaced but never dispatched.
    pub execute_tools: bool,
    /// Dispatch a call as soon as it is fully parsed instead of after the
    /// assistant message finalizes.
    pub execute_on_stream: bool,
    pub tool_execution_strategy: ToolExecutionStrategy,
    /// 0 = unlimited. When the limit is hit the stream is cut short with
    /// finish reason `xml_tool_limit_reached`.
    pub max_xml_tool_calls: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            xml_tool_calling: true,
            native_tool_calling: true,
            execute_tools: true,
            execute_on_stream: true,
            tool_execution_strategy: ToolExecutionStrategy::Sequential,
            max_xml_tool_calls: 0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Processor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ResponseProcessor {
    registry: Arc<ToolRegistry>,
    store: Arc<dyn MessageStore>,
    config: ProcessorConfig,
}

/// Mutable state for one processed assistant turn.
struct TurnState {
    thread_id: Uuid,
    sequence: u64,
    assistant_buf: String,
    xml_parser: StreamingXmlParser,
    xml_calls_parsed: usize,
    /// Calls parsed but not yet dispatched (deferred or execute-only-off).
    pending: Vec<ToolCall>,
    /// Native tool-call assembly, keyed by provider index.
    native_acc: BTreeMap<u32, NativeCall>,
    finish_reason: Option<String>,
    /// Set when a terminal tool ran; the turn closes with
    /// `assistant_response_end`.
    terminated: bool,
    tx: mpsc::UnboundedSender<Event>,
}

struct NativeCall {
    call_id: String,
    function_name: String,
    arguments_buf: String,
}

impl TurnState {
    fn emit(&self, event: Event) {
        // A dropped receiver just means the subscriber went away; the
        // worker-side log append is what matters for durability.
        let _ = self.tx.send(event);
    }
}

impl ResponseProcessor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        store: Arc<dyn MessageStore>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Drive one assistant turn. The returned stream yields events until
    /// the turn completes, errors, or is cancelled.
    pub fn process(
        self: Arc<Self>,
        thread_id: Uuid,
        llm_stream: BoxStream<'static, skein_domain::Result<LlmChunk>>,
        cancel: CancelToken,
    ) -> BoxStream<'static, Event> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let processor = Arc::clone(&self);
        tokio::spawn(async move {
            let mut state = TurnState {
                thread_id,
                sequence: 0,
                assistant_buf: String::new(),
                xml_parser: StreamingXmlParser::new()
                    .with_legacy_tags(processor.legacy_tags()),
                xml_calls_parsed: 0,
                pending: Vec::new(),
                native_acc: BTreeMap::new(),
                finish_reason: None,
                terminated: false,
                tx,
            };
            if let Err(e) = processor.drive(&mut state, llm_stream, &cancel).await {
                tracing::error!(%thread_id, error = %e, "response processor failed");
                state.emit(Event::status_with_message(
                    Some(thread_id),
                    StatusValue::Error,
                    e.to_string(),
                ));
            }
        });

        Box::pin(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    fn legacy_tags(&self) -> Vec<String> {
        self.registry
            .xml_bindings()
            .into_iter()
            .map(|(_, bindings)| bindings.tag_name)
            .collect()
    }

    async fn drive(
        &self,
        state: &mut TurnState,
        mut llm_stream: BoxStream<'static, skein_domain::Result<LlmChunk>>,
        cancel: &CancelToken,
    ) -> skein_domain::Result<()> {
        // ── Streaming assembly ───────────────────────────────────────
        while let Some(chunk) = llm_stream.next().await {
            if cancel.is_cancelled() {
                // Dropping the stream aborts the in-flight LLM read.
                break;
            }

            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // LLM-stream error: surface and close.
                    tracing::warn!(thread_id = %state.thread_id, error = %e, "llm stream error");
                    state.emit(Event::status_with_message(
                        Some(state.thread_id),
                        StatusValue::Error,
                        e.to_string(),
                    ));
                    return Ok(());
                }
            };

            match chunk {
                LlmChunk::Delta { text } => {
                    self.on_text_delta(state, &text, cancel).await;
                    if state.finish_reason.as_deref() == Some("xml_tool_limit_reached") {
                        break;
                    }
                }
                LlmChunk::Thinking { text } => {
                    tracing::trace!(len = text.len(), "reasoning delta (not persisted)");
                }
                LlmChunk::ToolCallStarted {
                    index,
                    call_id,
                    function_name,
                } if self.config.native_tool_calling => {
                    state.native_acc.insert(
                        index,
                        NativeCall {
                            call_id,
                            function_name,
                            arguments_buf: String::new(),
                        },
                    );
                }
                LlmChunk::ToolCallDelta { index, delta }
                    if self.config.native_tool_calling =>
                {
                    if let Some(call) = state.native_acc.get_mut(&index) {
                        call.arguments_buf.push_str(&delta);
                    }
                }
                LlmChunk::ToolCallStarted { .. } | LlmChunk::ToolCallDelta { .. } => {
                    // Native calling disabled: ignore provider tool frames.
                }
                LlmChunk::Done {
                    finish_reason,
                    usage: _,
                } => {
                    if state.finish_reason.is_none() {
                        state.finish_reason = finish_reason;
                    }
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            state.emit(Event::status(Some(state.thread_id), StatusValue::Stopped));
            return Ok(());
        }

        // Native calls complete once the stream ends.
        let native_calls = self.assemble_native_calls(state);
        state.pending.extend(native_calls);

        if let Some(reason) = state.finish_reason.clone() {
            state.emit(Event::finish(state.thread_id, reason));
        }

        // ── Assistant finalization ───────────────────────────────────
        let assistant_content = serde_json::json!({
            "role": "assistant",
            "content": state.assistant_buf,
        });
        let message = self
            .store
            .add_message(
                state.thread_id,
                MessageType::Assistant,
                assistant_content,
                true,
                Value::Null,
            )
            .await?;
        state.emit(Event::assistant(
            state.thread_id,
            message.message_id,
            state.assistant_buf.clone(),
        ));

        // ── Deferred tool dispatch ───────────────────────────────────
        if self.config.execute_tools && !state.pending.is_empty() {
            let calls = std::mem::take(&mut state.pending);
            match self.config.tool_execution_strategy {
                ToolExecutionStrategy::Sequential => {
                    for call in calls {
                        if cancel.is_cancelled() {
                            state.emit(Event::status(
                                Some(state.thread_id),
                                StatusValue::Stopped,
                            ));
                            return Ok(());
                        }
                        self.dispatch_one(state, call).await;
                        if state.terminated {
                            break;
                        }
                    }
                }
                ToolExecutionStrategy::Parallel => {
                    self.dispatch_parallel(state, calls, cancel).await;
                }
            }
        }

        // ── Terminal tool closes the turn ────────────────────────────
        if state.terminated {
            let end_content = serde_json::json!({ "role": "assistant", "status": "complete" });
            if let Err(e) = self
                .store
                .add_message(
                    state.thread_id,
                    MessageType::AssistantResponseEnd,
                    end_content.clone(),
                    false,
                    Value::Null,
                )
                .await
            {
                tracing::warn!(error = %e, "failed to persist assistant_response_end");
            }
            state.emit(Event::assistant_response_end(state.thread_id, end_content));
        }

        Ok(())
    }

    /// Append a text delta: emit the chunk event and feed the XML parser.
    async fn on_text_delta(&self, state: &mut TurnState, text: &str, cancel: &CancelToken) {
        state.assistant_buf.push_str(text);
        state.emit(Event::assistant_chunk(
            state.thread_id,
            state.sequence,
            text,
        ));
        state.sequence += 1;

        if !self.config.xml_tool_calling {
            return;
        }

        for xml_call in state.xml_parser.push(text) {
            let limit = self.config.max_xml_tool_calls;
            if limit > 0 && state.xml_calls_parsed >= limit {
                state.finish_reason = Some("xml_tool_limit_reached".into());
                return;
            }
            state.xml_calls_parsed += 1;

            let function_name = self
                .registry
                .tool_for_xml_tag(&xml_call.function_name)
                .unwrap_or_else(|| xml_call.function_name.clone());
            let call = ToolCall {
                id: format!("xml_{}", state.xml_calls_parsed),
                function_name,
                arguments: Value::Object(xml_call.parameters.clone().into_iter().collect()),
                source: CallSource::Xml,
                raw: xml_call.raw_xml.clone(),
            };

            if self.config.execute_tools && self.config.execute_on_stream {
                if cancel.is_cancelled() {
                    return;
                }
                self.dispatch_one(state, call).await;
                if limit > 0 && state.xml_calls_parsed >= limit {
                    state.finish_reason = Some("xml_tool_limit_reached".into());
                    return;
                }
            } else {
                state.pending.push(call);
            }
        }
    }

    fn assemble_native_calls(&self, state: &mut TurnState) -> Vec<ToolCall> {
        std::mem::take(&mut state.native_acc)
            .into_values()
            .map(|native| {
                let arguments = if native.arguments_buf.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&native.arguments_buf).unwrap_or_else(|e| {
                        tracing::warn!(
                            call_id = %native.call_id,
                            tool = %native.function_name,
                            error = %e,
                            "tool call arguments are not valid JSON, defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    })
                };
                ToolCall {
                    id: native.call_id,
                    function_name: native.function_name,
                    arguments,
                    source: CallSource::Native,
                    raw: native.arguments_buf,
                }
            })
            .collect()
    }

    /// Dispatch one call: `tool_started`, execute, persist the `tool`
    /// message, `tool_completed`. Dispatch errors become failed results;
    /// the run continues.
    async fn dispatch_one(&self, state: &mut TurnState, call: ToolCall) {
        state.emit(Event::tool_started(state.thread_id, &call));
        let execution = self.execute_call(&call).await;
        self.persist_and_emit(state, &call, execution).await;
    }

    /// Parallel strategy: all `tool_started` events first (input order),
    /// concurrent execution, completions emitted in input order.
    async fn dispatch_parallel(
        &self,
        state: &mut TurnState,
        calls: Vec<ToolCall>,
        cancel: &CancelToken,
    ) {
        if cancel.is_cancelled() {
            state.emit(Event::status(Some(state.thread_id), StatusValue::Stopped));
            return;
        }
        for call in &calls {
            state.emit(Event::tool_started(state.thread_id, call));
        }

        let executions =
            futures_util::future::join_all(calls.iter().map(|call| self.execute_call(call))).await;

        for (call, execution) in calls.into_iter().zip(executions) {
            self.persist_and_emit(state, &call, execution).await;
        }
    }

    async fn execute_call(&self, call: &ToolCall) -> ToolExecution {
        let result = match self
            .registry
            .dispatch(&call.function_name, call.arguments.clone())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(tool = %call.function_name, error = %e, "tool dispatch failed");
                ToolResult::failed(e.to_string())
            }
        };
        ToolExecution {
            function_name: call.function_name.clone(),
            call_id: call.id.clone(),
            arguments: call.arguments.clone(),
            result,
        }
    }

    async fn persist_and_emit(
        &self,
        state: &mut TurnState,
        call: &ToolCall,
        execution: ToolExecution,
    ) {
        if self.registry.terminates_run(&call.function_name) {
            state.terminated = true;
        }

        let content = serde_json::json!({ "tool_execution": execution });
        match self
            .store
            .add_message(state.thread_id, MessageType::Tool, content, true, Value::Null)
            .await
        {
            Ok(message) => {
                state.emit(Event::tool_completed(state.thread_id, execution.clone()));
                state.emit(Event::tool(state.thread_id, message.message_id, execution));
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist tool message");
                state.emit(Event::tool_completed(state.thread_id, execution));
            }
        }
    }
}
