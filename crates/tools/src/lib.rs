//! The in-process tool registry.
//!
//! A mapping `tool_name → {schema, dispatcher}`. Dispatchers are ordinary
//! async function values: builtins run in-process, MCP-namespaced entries
//! proxy to the client pool. The registry also renders OpenAPI-shaped
//! schemas for native function-calling and XML bindings for the XML path.

pub mod builtin;
pub mod registry;

pub use registry::{ToolDispatcher, ToolRegistry};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use skein_domain::tool::ToolResult;
use skein_domain::Result;
use skein_mcp_client::McpClientPool;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP proxy dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatcher that forwards a namespaced tool call to the MCP pool.
pub struct McpProxyTool {
    pool: Arc<McpClientPool>,
    namespaced_name: String,
}

impl McpProxyTool {
    pub fn new(pool: Arc<McpClientPool>, namespaced_name: impl Into<String>) -> Self {
        Self {
            pool,
            namespaced_name: namespaced_name.into(),
        }
    }
}

#[async_trait]
impl ToolDispatcher for McpProxyTool {
    async fn dispatch(&self, arguments: Value) -> Result<ToolResult> {
        let invocation = self
            .pool
            .invoke_namespaced(&self.namespaced_name, &arguments)
            .await?;
        if invocation.is_error {
            Ok(ToolResult::failed(invocation.content))
        } else {
            Ok(ToolResult::ok(invocation.content))
        }
    }
}

/// Register every tool from an MCP catalog as a proxy entry.
pub fn register_mcp_tools(
    registry: &ToolRegistry,
    pool: &Arc<McpClientPool>,
    catalog: &skein_mcp_client::McpToolCatalog,
) {
    for schema in &catalog.schemas {
        let dispatcher = McpProxyTool::new(Arc::clone(pool), schema.name.clone());
        registry.register(schema.clone(), Arc::new(dispatcher));
    }
}
