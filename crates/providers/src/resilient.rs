//! Retry and rate-limit policy around any [`LlmClient`].
//!
//! Connection-phase failures are retried here; once a stream is open,
//! errors surface through the stream and the response processor decides.
//! Policy: transport/timeout failures back off exponentially with jitter;
//! rate limiting honors a fixed delay; persistent rate limiting re-routes
//! to an aggregator fallback when one is configured.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use skein_domain::stream::{BoxStream, LlmChunk};
use skein_domain::{Error, Result};

use crate::traits::{ChatRequest, ChatResponse, LlmClient};

/// Extra attempts for transport-class failures.
const MAX_RETRIES: u32 = 2;

/// Base delay for jittered exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Fixed delay honored after a rate-limit response.
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(30);

pub struct ResilientClient {
    primary: Arc<dyn LlmClient>,
    /// Aggregator endpoint (e.g. OpenRouter) tried when the primary stays
    /// rate-limited through its retry budget.
    fallback: Option<Arc<dyn LlmClient>>,
}

impl ResilientClient {
    pub fn new(primary: Arc<dyn LlmClient>) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn LlmClient>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    async fn run_with_policy<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<dyn LlmClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(Arc::clone(&self.primary)).await {
                Ok(value) => return Ok(value),
                Err(Error::RateLimited { provider }) if attempt < MAX_RETRIES => {
                    tracing::warn!(%provider, delay_secs = RATE_LIMIT_DELAY.as_secs(), "rate limited, waiting");
                    tokio::time::sleep(RATE_LIMIT_DELAY).await;
                    attempt += 1;
                }
                Err(Error::RateLimited { provider }) => {
                    let Some(fallback) = &self.fallback else {
                        return Err(Error::RateLimited { provider });
                    };
                    tracing::warn!(%provider, fallback = fallback.provider_id(), "persistent rate limiting, re-routing");
                    return op(Arc::clone(fallback)).await;
                }
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    let backoff = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    let jitter = Duration::from_millis(
                        rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4),
                    );
                    tracing::debug!(attempt, error = %e, "retrying llm request");
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(Error::ProviderUnavailable {
                        provider: self.primary.provider_id().to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for ResilientClient {
    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<LlmChunk>>> {
        self.run_with_policy(|client| {
            let req = req.clone();
            async move { client.stream(req).await }
        })
        .await
    }

    async fn complete(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.run_with_policy(|client| {
            let req = req.clone();
            async move { client.complete(req).await }
        })
        .await
    }

    fn provider_id(&self) -> &str {
        self.primary.provider_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedClient {
        id: String,
        failures: AtomicU32,
        error: fn(&str) -> Error,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(id: &str, failures: u32, error: fn(&str) -> Error) -> Self {
            Self {
                id: id.into(),
                failures: AtomicU32::new(failures),
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for ScriptedClient {
        async fn stream(
            &self,
            _req: ChatRequest,
        ) -> Result<BoxStream<'static, Result<LlmChunk>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err((self.error)(&self.id));
            }
            Ok(Box::pin(futures_util::stream::iter(vec![Ok(
                LlmChunk::Done {
                    usage: None,
                    finish_reason: Some("stop".into()),
                },
            )])))
        }

        async fn complete(&self, _req: ChatRequest) -> Result<ChatResponse> {
            unimplemented!("not used in these tests")
        }

        fn provider_id(&self) -> &str {
            &self.id
        }
    }

    fn transport_error(id: &str) -> Error {
        Error::Transport(format!("{id}: connection reset"))
    }

    fn rate_limit_error(id: &str) -> Error {
        Error::RateLimited { provider: id.into() }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_transport_failures_recover() {
        let primary = Arc::new(ScriptedClient::new("p", 2, transport_error));
        let client = ResilientClient::new(Arc::clone(&primary) as Arc<dyn LlmClient>);

        client.stream(ChatRequest::default()).await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transport_retries_become_provider_unavailable() {
        let primary = Arc::new(ScriptedClient::new("p", 10, transport_error));
        let client = ResilientClient::new(primary as Arc<dyn LlmClient>);

        let err = match client.stream(ChatRequest::default()).await {
            Ok(_) => panic!("called `Result::unwrap_err()` on an `Ok` value"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::ProviderUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_rate_limit_reroutes_to_fallback() {
        let primary = Arc::new(ScriptedClient::new("p", 10, rate_limit_error));
        let fallback = Arc::new(ScriptedClient::new("openrouter", 0, transport_error));
        let client = ResilientClient::new(Arc::clone(&primary) as Arc<dyn LlmClient>)
            .with_fallback(Arc::clone(&fallback) as Arc<dyn LlmClient>);

        client.stream(ChatRequest::default()).await.unwrap();
        // Primary tried 1 + MAX_RETRIES times, fallback once.
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1 + MAX_RETRIES);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_fallback_surfaces() {
        let primary = Arc::new(ScriptedClient::new("p", 10, rate_limit_error));
        let client = ResilientClient::new(primary as Arc<dyn LlmClient>);

        let err = match client.stream(ChatRequest::default()).await {
            Ok(_) => panic!("called `Result::unwrap_err()` on an `Ok` value"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::RateLimited { .. }));
    }
}
