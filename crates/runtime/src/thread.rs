//! Thread manager — owns one conversation thread: message persistence,
//! context preparation, LLM invocation, and processor wiring.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use skein_domain::event::{Event, StatusValue};
use skein_domain::message::{Message, MessageType};
use skein_domain::store::MessageStore;
use skein_domain::stream::{BoxStream, LlmMessage};
use skein_domain::run::ReasoningEffort;
use skein_domain::Result;
use skein_providers::{ChatRequest, LlmClient, ToolChoice};
use skein_tools::ToolRegistry;

use crate::cancel::CancelToken;
use crate::context::ContextManager;
use crate::processor::{ProcessorConfig, ResponseProcessor};

/// Parameters for one `run_thread` invocation.
pub struct RunThreadParams {
    pub thread_id: Uuid,
    pub system_prompt: String,
    pub llm_model: String,
    pub tool_choice: ToolChoice,
    pub processor_config: ProcessorConfig,
    /// Shown to the model this turn only; never persisted.
    pub temporary_message: Option<Value>,
    pub enable_thinking: bool,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub enable_context_manager: bool,
    pub cancel: CancelToken,
}

pub struct ThreadManager {
    store: Arc<dyn MessageStore>,
    registry: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    context: ContextManager,
}

impl ThreadManager {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            store,
            registry,
            llm,
            context: ContextManager::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Persist a message to the thread, returning the stored record.
    pub async fn add_message(
        &self,
        thread_id: Uuid,
        message_type: MessageType,
        content: Value,
        is_llm_message: bool,
        metadata: Option<Value>,
    ) -> Result<Message> {
        self.store
            .add_message(
                thread_id,
                message_type,
                content,
                is_llm_message,
                metadata.unwrap_or(Value::Null),
            )
            .await
    }

    /// Load the LLM-visible conversation. Standalone `image_context` rows
    /// are attached inline to the most recent user message and deleted —
    /// a one-shot attachment, so reruns don't resend stale screenshots.
    pub async fn get_llm_messages(&self, thread_id: Uuid) -> Result<Vec<LlmMessage>> {
        let stored = self.store.get_messages(thread_id).await?;

        let mut messages: Vec<LlmMessage> = Vec::with_capacity(stored.len());
        let mut image_contexts: Vec<Message> = Vec::new();

        for message in stored {
            if message.message_type == MessageType::ImageContext {
                image_contexts.push(message);
                continue;
            }
            if !message.is_llm_message {
                continue;
            }
            let role = message
                .role()
                .map(str::to_string)
                .unwrap_or_else(|| default_role(message.message_type).to_string());
            let content = message
                .content
                .get("content")
                .cloned()
                .unwrap_or_else(|| message.content.clone());
            let mut llm_message = LlmMessage::new(role, content);
            llm_message.message_id = Some(message.message_id);
            messages.push(llm_message);
        }

        for image in image_contexts {
            attach_image_to_last_user(&mut messages, &image);
            if let Err(e) = self.store.delete_message(image.message_id).await {
                tracing::warn!(message_id = %image.message_id, error = %e, "failed to delete one-shot image context");
            }
        }

        Ok(messages)
    }

    /// Run one assistant turn against the thread and stream its events.
    pub async fn run_thread(self: &Arc<Self>, params: RunThreadParams) -> BoxStream<'static, Event> {
        let thread_id = params.thread_id;

        let mut messages = match self.get_llm_messages(thread_id).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(%thread_id, error = %e, "failed to load thread history");
                return error_stream(thread_id, e.to_string());
            }
        };

        if params.enable_context_manager {
            messages = self.context.compress(messages, &params.llm_model);
        }

        let mut prepared = Vec::with_capacity(messages.len() + 2);
        prepared.push(LlmMessage::text("system", params.system_prompt.clone()));
        prepared.extend(messages);
        if let Some(temporary) = &params.temporary_message {
            prepared.push(LlmMessage::new("user", temporary.clone()));
        }

        let request = ChatRequest {
            messages: prepared,
            model: params.llm_model.clone(),
            tools: if params.processor_config.native_tool_calling {
                self.registry.openapi_tools()
            } else {
                Vec::new()
            },
            tool_choice: params.tool_choice,
            temperature: None,
            max_tokens: None,
            enable_thinking: params.enable_thinking,
            reasoning_effort: params.reasoning_effort,
        };

        let llm_stream = match self.llm.stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(%thread_id, error = %e, "llm request failed");
                return error_stream(thread_id, e.to_string());
            }
        };

        let processor = Arc::new(ResponseProcessor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            params.processor_config.clone(),
        ));
        processor.process(thread_id, llm_stream, params.cancel.clone())
    }
}

fn default_role(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Assistant | MessageType::AssistantResponseEnd => "assistant",
        MessageType::Tool => "tool",
        _ => "user",
    }
}

/// Fold an image-context row into the most recent user message as a
/// content part list.
fn attach_image_to_last_user(messages: &mut [LlmMessage], image: &Message) {
    let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == "user") else {
        tracing::debug!("image context with no user message to attach to");
        return;
    };

    let image_part = image.content.clone();
    match &mut last_user.content {
        Value::Array(parts) => parts.push(image_part),
        other => {
            let text_part = serde_json::json!({ "type": "text", "text": match &*other {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            }});
            *other = Value::Array(vec![text_part, image_part]);
        }
    }
}

fn error_stream(thread_id: Uuid, message: String) -> BoxStream<'static, Event> {
    Box::pin(futures_util::stream::iter(vec![
        Event::status_with_message(Some(thread_id), StatusValue::Error, message),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_domain::store::InMemoryMessageStore;

    async fn seeded_store() -> (Arc<InMemoryMessageStore>, Uuid) {
        let store = InMemoryMessageStore::shared();
        let thread_id = Uuid::new_v4();
        store
            .add_message(
                thread_id,
                MessageType::User,
                serde_json::json!({ "role": "user", "content": "first question" }),
                true,
                Value::Null,
            )
            .await
            .unwrap();
        store
            .add_message(
                thread_id,
                MessageType::Assistant,
                serde_json::json!({ "role": "assistant", "content": "an answer" }),
                true,
                Value::Null,
            )
            .await
            .unwrap();
        (store, thread_id)
    }

    fn manager(store: Arc<InMemoryMessageStore>) -> Arc<ThreadManager> {
        struct NeverClient;

        #[async_trait::async_trait]
        impl LlmClient for NeverClient {
            async fn stream(
                &self,
                _req: ChatRequest,
            ) -> Result<BoxStream<'static, Result<skein_domain::stream::LlmChunk>>> {
                unimplemented!("not exercised")
            }
            async fn complete(&self, _req: ChatRequest) -> Result<skein_providers::ChatResponse> {
                unimplemented!("not exercised")
            }
            fn provider_id(&self) -> &str {
                "never"
            }
        }

        Arc::new(ThreadManager::new(
            store,
            Arc::new(ToolRegistry::new()),
            Arc::new(NeverClient),
        ))
    }

    #[tokio::test]
    async fn llm_messages_carry_roles_and_ids() {
        let (store, thread_id) = seeded_store().await;
        let manager = manager(store);

        let messages = manager.get_llm_messages(thread_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, Value::String("first question".into()));
        assert!(messages[0].message_id.is_some());
        assert_eq!(messages[1].role, "assistant");
    }

    #[tokio::test]
    async fn non_llm_rows_are_skipped() {
        let (store, thread_id) = seeded_store().await;
        store
            .add_message(
                thread_id,
                MessageType::Status,
                serde_json::json!({ "status": "running" }),
                false,
                Value::Null,
            )
            .await
            .unwrap();
        let manager = manager(store);
        let messages = manager.get_llm_messages(thread_id).await.unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn image_context_attaches_once_then_disappears() {
        let (store, thread_id) = seeded_store().await;
        store
            .add_message(
                thread_id,
                MessageType::User,
                serde_json::json!({ "role": "user", "content": "look at this" }),
                true,
                Value::Null,
            )
            .await
            .unwrap();
        store
            .add_message(
                thread_id,
                MessageType::ImageContext,
                serde_json::json!({ "type": "image_url", "image_url": { "url": "stored://img-1" } }),
                false,
                Value::Null,
            )
            .await
            .unwrap();
        let manager = manager(store.clone());

        let messages = manager.get_llm_messages(thread_id).await.unwrap();
        let last_user = messages.iter().rev().find(|m| m.role == "user").unwrap();
        let parts = last_user.content.as_array().expect("content became parts");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "look at this");
        assert_eq!(parts[1]["image_url"]["url"], "stored://img-1");

        // Second load: the image row is gone.
        let messages = manager.get_llm_messages(thread_id).await.unwrap();
        let last_user = messages.iter().rev().find(|m| m.role == "user").unwrap();
        assert_eq!(last_user.content, Value::String("look at this".into()));
    }
}
