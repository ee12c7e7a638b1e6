//! The client pool: catalog discovery with caching, namespaced dispatch,
//! and retry policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use skein_broker::Broker;
use skein_domain::config::MCP_SCHEMA_TTL;
use skein_domain::mcp::McpServerConfig;
use skein_domain::tool::{ToolSchema, ToolSource};

use crate::endpoint::{EndpointResolver, SessionSpec};
use crate::protocol::{McpToolDef, ToolCallOutcome, ToolsListResult};
use crate::transport::McpSession;
use crate::McpError;

/// Provider identifier length limit; longer namespaced names are
/// stable-hash-truncated.
const MAX_TOOL_NAME_LEN: usize = 64;

/// Deadline for one connection attempt (open + handshake).
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for one complete tool invocation (open, call, close).
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// `Transport`/`Timeout` failures get this many extra attempts.
const MAX_RETRIES: u32 = 2;

/// Base delay for jittered exponential backoff between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// How many servers initialize concurrently.
const INIT_PARALLELISM: usize = 4;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connector seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The network edge of the pool. One implementation opens a fresh session
/// per operation; tests substitute a double to observe connection counts.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn list_tools(&self, spec: &SessionSpec) -> Result<Vec<McpToolDef>, McpError>;

    async fn call_tool(
        &self,
        spec: &SessionSpec,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<ToolCallOutcome, McpError>;
}

/// Default connector: open transport → initialize → one request → close.
pub struct SessionConnector;

#[async_trait]
impl McpConnector for SessionConnector {
    async fn list_tools(&self, spec: &SessionSpec) -> Result<Vec<McpToolDef>, McpError> {
        let mut session = tokio::time::timeout(CONNECT_TIMEOUT, McpSession::open(spec))
            .await
            .map_err(|_| McpError::Timeout(CONNECT_TIMEOUT))??;
        let result = session.request("tools/list", None).await;
        session.close().await;
        let value = result?;
        let parsed: ToolsListResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("tools/list result: {e}")))?;
        Ok(parsed.tools)
    }

    async fn call_tool(
        &self,
        spec: &SessionSpec,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<ToolCallOutcome, McpError> {
        let mut session = tokio::time::timeout(CONNECT_TIMEOUT, McpSession::open(spec))
            .await
            .map_err(|_| McpError::Timeout(CONNECT_TIMEOUT))??;
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let result = session.request("tools/call", Some(params)).await;
        session.close().await;
        let value = result?;
        serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("tools/call result: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public result types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Uniform result of one MCP tool invocation.
#[derive(Debug, Clone)]
pub struct McpInvocation {
    pub content: String,
    pub is_error: bool,
}

/// Catalog of everything the pool discovered for a run.
#[derive(Debug, Clone, Default)]
pub struct McpToolCatalog {
    pub schemas: Vec<ToolSchema>,
    /// Servers that failed discovery, with the reason. Non-fatal.
    pub failures: Vec<(String, String)>,
}

/// Result of a one-shot discovery against an unregistered config.
#[derive(Debug, Clone)]
pub struct CustomMcpDiscovery {
    pub qualified_name: String,
    pub display_name: String,
    pub tools: Vec<McpToolDef>,
}

#[derive(Serialize, Deserialize)]
struct CachedCatalog {
    tools: Vec<McpToolDef>,
    fetched_at: chrono::DateTime<chrono::Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ServerEntry {
    config: McpServerConfig,
    tools: Vec<McpToolDef>,
}

/// Connection pool for one run's MCP servers.
pub struct McpClientPool {
    broker: Arc<dyn Broker>,
    resolver: EndpointResolver,
    connector: Arc<dyn McpConnector>,
    servers: RwLock<HashMap<String, ServerEntry>>,
    /// Namespaced tool name → (qualified server name, remote tool name).
    name_map: RwLock<HashMap<String, (String, String)>>,
}

impl McpClientPool {
    pub fn new(broker: Arc<dyn Broker>, resolver: EndpointResolver) -> Self {
        Self::with_connector(broker, resolver, Arc::new(SessionConnector))
    }

    pub fn with_connector(
        broker: Arc<dyn Broker>,
        resolver: EndpointResolver,
        connector: Arc<dyn McpConnector>,
    ) -> Self {
        Self {
            broker,
            resolver,
            connector,
            servers: RwLock::new(HashMap::new()),
            name_map: RwLock::new(HashMap::new()),
        }
    }

    /// Discover catalogs for every configured server, concurrently with
    /// bounded parallelism. Per-server failure is recorded, not raised:
    /// tools from failed servers are simply absent.
    pub async fn initialize(&self, configs: &[McpServerConfig]) -> McpToolCatalog {
        let results: Vec<_> = futures_util::stream::iter(configs.iter().cloned())
            .map(|config| async move {
                let name = config.qualified_name.clone();
                let outcome = self.discover(&config).await;
                (name, config, outcome)
            })
            .buffer_unordered(INIT_PARALLELISM)
            .collect()
            .await;

        let mut catalog = McpToolCatalog::default();
        for (name, config, outcome) in results {
            match outcome {
                Ok(tools) => {
                    tracing::info!(server = %name, tool_count = tools.len(), "mcp server ready");
                    self.register(config, tools);
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "mcp server failed to initialize, skipping");
                    catalog.failures.push((name, e.to_string()));
                }
            }
        }
        catalog.schemas = self.tool_schemas();
        catalog
    }

    /// Fetch a server's catalog, consulting the broker-backed schema cache
    /// first. A cache hit performs no network calls.
    pub async fn discover(&self, config: &McpServerConfig) -> Result<Vec<McpToolDef>, McpError> {
        let fingerprint = config_fingerprint(config);
        let cache_key = schema_cache_key(&fingerprint);

        if let Ok(Some(raw)) = self.broker.get(&cache_key).await {
            match serde_json::from_str::<CachedCatalog>(&raw) {
                Ok(cached) => {
                    tracing::debug!(server = %config.qualified_name, "mcp schema cache hit");
                    return Ok(cached.tools);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "discarding undecodable cached catalog")
                }
            }
        }

        let spec = self.resolver.resolve(config).await?;
        let tools = with_retries(|| self.connector.list_tools(&spec)).await?;

        let cached = CachedCatalog {
            tools: tools.clone(),
            fetched_at: chrono::Utc::now(),
        };
        if let Ok(json) = serde_json::to_string(&cached) {
            if let Err(e) = self.broker.set(&cache_key, &json, Some(MCP_SCHEMA_TTL)).await {
                tracing::warn!(error = %e, "mcp schema cache write failed");
            }
        }
        Ok(tools)
    }

    /// One-shot discovery for a config that is not part of this run.
    pub async fn discover_tools(
        &self,
        config: &McpServerConfig,
    ) -> Result<CustomMcpDiscovery, McpError> {
        let tools = self.discover(config).await?;
        Ok(CustomMcpDiscovery {
            qualified_name: config.qualified_name.clone(),
            display_name: if config.display_name.is_empty() {
                config.qualified_name.clone()
            } else {
                config.display_name.clone()
            },
            tools,
        })
    }

    fn register(&self, config: McpServerConfig, tools: Vec<McpToolDef>) {
        let mut name_map = self.name_map.write();
        for tool in &tools {
            let namespaced = namespaced_tool_name(&config.qualified_name, &tool.name);
            name_map.insert(
                namespaced,
                (config.qualified_name.clone(), tool.name.clone()),
            );
        }
        self.servers
            .write()
            .insert(config.qualified_name.clone(), ServerEntry { config, tools });
    }

    /// Schemas for every enabled tool across connected servers, under
    /// their namespaced names.
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        let servers = self.servers.read();
        let mut schemas: Vec<ToolSchema> = Vec::new();
        for entry in servers.values() {
            for tool in &entry.tools {
                if !entry.config.tool_enabled(&tool.name) {
                    continue;
                }
                schemas.push(ToolSchema {
                    name: namespaced_tool_name(&entry.config.qualified_name, &tool.name),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    source: ToolSource::Mcp {
                        qualified_name: entry.config.qualified_name.clone(),
                    },
                    xml_bindings: None,
                    terminates_run: false,
                });
            }
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Resolve a namespaced name back to `(qualified_name, tool_name)`.
    pub fn resolve_name(&self, namespaced: &str) -> Option<(String, String)> {
        self.name_map.read().get(namespaced).cloned()
    }

    /// Dispatch a namespaced tool call.
    pub async fn invoke_namespaced(
        &self,
        namespaced: &str,
        arguments: &Value,
    ) -> Result<McpInvocation, McpError> {
        let (qualified_name, tool_name) = self
            .resolve_name(namespaced)
            .ok_or_else(|| McpError::NotFound(namespaced.to_string()))?;
        self.invoke(&qualified_name, &tool_name, arguments).await
    }

    /// Dispatch a tool call on a connected server. Opens a fresh session,
    /// retries `Transport`/`Timeout` failures with jittered backoff, and
    /// maps a remote `isError` flag into a failed invocation.
    pub async fn invoke(
        &self,
        qualified_name: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<McpInvocation, McpError> {
        let config = {
            let servers = self.servers.read();
            let entry = servers
                .get(qualified_name)
                .ok_or_else(|| McpError::NotFound(format!("{qualified_name} (not connected)")))?;
            if !entry.tools.iter().any(|t| t.name == tool_name) {
                return Err(McpError::NotFound(format!("{qualified_name}::{tool_name}")));
            }
            if !entry.config.tool_enabled(tool_name) {
                return Err(McpError::NotFound(format!(
                    "{qualified_name}::{tool_name} (disabled by config)"
                )));
            }
            entry.config.clone()
        };

        if !arguments.is_object() && !arguments.is_null() {
            return Err(McpError::InvalidArgs(
                "tool arguments must be a JSON object".into(),
            ));
        }

        let spec = self.resolver.resolve(&config).await?;
        let outcome = with_retries(|| async {
            tokio::time::timeout(
                CALL_TIMEOUT,
                self.connector.call_tool(&spec, tool_name, arguments),
            )
            .await
            .map_err(|_| McpError::Timeout(CALL_TIMEOUT))?
        })
        .await?;

        Ok(McpInvocation {
            content: outcome.text(),
            is_error: outcome.is_error,
        })
    }

    /// Qualified names of currently connected servers.
    pub fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop all per-run state. With per-invoke sessions there is nothing
    /// live to tear down.
    pub fn close(&self) {
        self.servers.write().clear();
        self.name_map.write().clear();
    }
}

fn schema_cache_key(fingerprint: &str) -> String {
    format!("mcp_schema:{fingerprint}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn with_retries<T, F, Fut>(mut op: F) -> Result<T, McpError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, McpError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                let backoff = RETRY_BASE_DELAY * 2u32.pow(attempt);
                let jitter = Duration::from_millis(
                    rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4),
                );
                tracing::debug!(attempt, error = %e, "retrying mcp operation");
                tokio::time::sleep(backoff + jitter).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Naming & fingerprints
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Namespaced name presented to the LLM: `mcp_<qualified>_<tool>`, with
/// non-identifier characters flattened and over-long names stable-hash-
/// truncated.
pub fn namespaced_tool_name(qualified_name: &str, tool_name: &str) -> String {
    let sanitized: String = qualified_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let full = format!("mcp_{sanitized}_{tool_name}");
    if full.len() <= MAX_TOOL_NAME_LEN {
        return full;
    }
    let digest = Sha256::digest(full.as_bytes());
    let suffix = hex::encode(&digest[..3]);
    let keep = MAX_TOOL_NAME_LEN - suffix.len() - 1;
    let mut truncated: String = full.chars().take(keep).collect();
    truncated.push('_');
    truncated.push_str(&suffix);
    truncated
}

/// Stable hash of the normalized config: JSON with sorted keys, volatile
/// fields (`headers`, `external_user_id`) removed.
pub fn config_fingerprint(config: &McpServerConfig) -> String {
    let mut value = serde_json::to_value(config).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("headers");
        map.remove("external_user_id");
        map.remove("enabled_tools");
        map.remove("display_name");
    }
    // serde_json objects iterate in sorted key order, so the string form
    // is already canonical.
    let canonical = value.to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_broker::MemoryBroker;
    use skein_domain::mcp::McpTransportConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnector {
        list_calls: AtomicUsize,
        call_calls: AtomicUsize,
        fail_first_n: AtomicUsize,
    }

    impl CountingConnector {
        fn new() -> Self {
            Self {
                list_calls: AtomicUsize::new(0),
                call_calls: AtomicUsize::new(0),
                fail_first_n: AtomicUsize::new(0),
            }
        }

        fn failing_first(n: usize) -> Self {
            let c = Self::new();
            c.fail_first_n.store(n, Ordering::SeqCst);
            c
        }
    }

    #[async_trait]
    impl McpConnector for CountingConnector {
        async fn list_tools(&self, _spec: &SessionSpec) -> Result<Vec<McpToolDef>, McpError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![McpToolDef {
                name: "web_search".into(),
                description: "Search the web".into(),
                input_schema: serde_json::json!({ "type": "object", "properties": { "query": { "type": "string" } } }),
            }])
        }

        async fn call_tool(
            &self,
            _spec: &SessionSpec,
            tool_name: &str,
            arguments: &Value,
        ) -> Result<ToolCallOutcome, McpError> {
            self.call_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first_n
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(McpError::Transport("flaky network".into()));
            }
            Ok(ToolCallOutcome {
                content: vec![crate::protocol::ToolContentBlock {
                    content_type: "text".into(),
                    text: format!("{tool_name}: {arguments}"),
                }],
                is_error: false,
            })
        }
    }

    fn server_config(name: &str) -> McpServerConfig {
        McpServerConfig {
            qualified_name: name.into(),
            display_name: String::new(),
            transport: McpTransportConfig::StreamableHttp {
                url: format!("https://{name}.example/mcp"),
                headers: HashMap::new(),
            },
            enabled_tools: vec![],
            external_user_id: None,
        }
    }

    fn pool_with(connector: Arc<CountingConnector>) -> (McpClientPool, Arc<dyn Broker>) {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let pool = McpClientPool::with_connector(
            Arc::clone(&broker),
            EndpointResolver::direct_only(),
            connector,
        );
        (pool, broker)
    }

    #[tokio::test]
    async fn initialize_discovers_and_namespaces() {
        let connector = Arc::new(CountingConnector::new());
        let (pool, _) = pool_with(Arc::clone(&connector));

        let catalog = pool.initialize(&[server_config("exa")]).await;
        assert!(catalog.failures.is_empty());
        assert_eq!(catalog.schemas.len(), 1);
        assert_eq!(catalog.schemas[0].name, "mcp_exa_web_search");
        assert_eq!(
            pool.resolve_name("mcp_exa_web_search"),
            Some(("exa".into(), "web_search".into()))
        );
    }

    #[tokio::test]
    async fn second_discovery_hits_cache() {
        let connector = Arc::new(CountingConnector::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        // First pool performs the network list_tools.
        let pool1 = McpClientPool::with_connector(
            Arc::clone(&broker),
            EndpointResolver::direct_only(),
            Arc::clone(&connector) as Arc<dyn McpConnector>,
        );
        pool1.initialize(&[server_config("exa")]).await;
        assert_eq!(connector.list_calls.load(Ordering::SeqCst), 1);

        // Second pool with the same config and broker: zero network calls
        // before its first invocation.
        let pool2 = McpClientPool::with_connector(
            Arc::clone(&broker),
            EndpointResolver::direct_only(),
            Arc::clone(&connector) as Arc<dyn McpConnector>,
        );
        let catalog = pool2.initialize(&[server_config("exa")]).await;
        assert_eq!(connector.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.schemas.len(), 1);
    }

    #[tokio::test]
    async fn invoke_round_trip() {
        let connector = Arc::new(CountingConnector::new());
        let (pool, _) = pool_with(Arc::clone(&connector));
        pool.initialize(&[server_config("exa")]).await;

        let result = pool
            .invoke_namespaced("mcp_exa_web_search", &serde_json::json!({ "query": "rust" }))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.content.contains("web_search"));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried() {
        let connector = Arc::new(CountingConnector::failing_first(2));
        let (pool, _) = pool_with(Arc::clone(&connector));
        pool.initialize(&[server_config("exa")]).await;

        let result = pool
            .invoke("exa", "web_search", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(!result.is_error);
        // 1 original + 2 retries that failed, then the success.
        assert_eq!(connector.call_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let connector = Arc::new(CountingConnector::new());
        let (pool, _) = pool_with(connector);
        pool.initialize(&[server_config("exa")]).await;

        let err = pool
            .invoke("exa", "no_such_tool", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotFound(_)));

        let err = pool
            .invoke_namespaced("mcp_nope_tool", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotFound(_)));
    }

    #[tokio::test]
    async fn disabled_tool_is_not_found() {
        let connector = Arc::new(CountingConnector::new());
        let (pool, _) = pool_with(connector);
        let mut config = server_config("exa");
        config.enabled_tools = vec!["another_tool".into()];
        pool.initialize(&[config]).await;

        let err = pool
            .invoke("exa", "web_search", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotFound(_)));
    }

    #[tokio::test]
    async fn zero_tool_server_connects_but_is_useless() {
        struct EmptyConnector;

        #[async_trait]
        impl McpConnector for EmptyConnector {
            async fn list_tools(&self, _: &SessionSpec) -> Result<Vec<McpToolDef>, McpError> {
                Ok(vec![])
            }
            async fn call_tool(
                &self,
                _: &SessionSpec,
                _: &str,
                _: &Value,
            ) -> Result<ToolCallOutcome, McpError> {
                unreachable!("no tools to call")
            }
        }

        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let pool = McpClientPool::with_connector(
            broker,
            EndpointResolver::direct_only(),
            Arc::new(EmptyConnector),
        );
        let catalog = pool.initialize(&[server_config("empty")]).await;
        assert!(catalog.failures.is_empty());
        assert!(catalog.schemas.is_empty());
        assert_eq!(pool.connected_servers(), vec!["empty".to_string()]);

        let err = pool
            .invoke("empty", "anything", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotFound(_)));
    }

    #[tokio::test]
    async fn partial_failure_is_nonfatal() {
        struct HalfBrokenConnector;

        #[async_trait]
        impl McpConnector for HalfBrokenConnector {
            async fn list_tools(&self, spec: &SessionSpec) -> Result<Vec<McpToolDef>, McpError> {
                match spec {
                    SessionSpec::Http { url, .. } if url.contains("bad") => {
                        Err(McpError::Protocol("handshake rejected".into()))
                    }
                    _ => Ok(vec![McpToolDef {
                        name: "ok_tool".into(),
                        description: String::new(),
                        input_schema: serde_json::json!({ "type": "object" }),
                    }]),
                }
            }
            async fn call_tool(
                &self,
                _: &SessionSpec,
                _: &str,
                _: &Value,
            ) -> Result<ToolCallOutcome, McpError> {
                Ok(ToolCallOutcome { content: vec![], is_error: false })
            }
        }

        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let pool = McpClientPool::with_connector(
            broker,
            EndpointResolver::direct_only(),
            Arc::new(HalfBrokenConnector),
        );
        let catalog = pool
            .initialize(&[server_config("good"), server_config("bad")])
            .await;
        assert_eq!(catalog.failures.len(), 1);
        assert_eq!(catalog.failures[0].0, "bad");
        assert_eq!(catalog.schemas.len(), 1);
        assert_eq!(catalog.schemas[0].name, "mcp_good_ok_tool");
    }

    #[test]
    fn namespacing_sanitizes_and_truncates() {
        assert_eq!(
            namespaced_tool_name("exa", "web_search"),
            "mcp_exa_web_search"
        );
        assert_eq!(
            namespaced_tool_name("smithery-ai/github", "create_issue"),
            "mcp_smithery_ai_github_create_issue"
        );

        let long = namespaced_tool_name(
            "a-very-long-qualified-server-name-indeed",
            "an_equally_long_tool_name_that_overflows",
        );
        assert_eq!(long.len(), MAX_TOOL_NAME_LEN);
        // Stable: same inputs, same truncation.
        assert_eq!(
            long,
            namespaced_tool_name(
                "a-very-long-qualified-server-name-indeed",
                "an_equally_long_tool_name_that_overflows",
            )
        );
    }

    #[test]
    fn fingerprint_ignores_volatile_fields() {
        let mut a = server_config("exa");
        let mut b = server_config("exa");
        a.external_user_id = Some("user-1".into());
        b.external_user_id = Some("user-2".into());
        b.display_name = "Exa".into();
        assert_eq!(config_fingerprint(&a), config_fingerprint(&b));

        let other = server_config("different");
        assert_ne!(config_fingerprint(&a), config_fingerprint(&other));
    }
}
