//! Registry storage and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use skein_domain::tool::{ToolResult, ToolSchema, XmlBindings};
use skein_domain::{Error, Result};

/// An async tool implementation. Dispatchers return `{success, output}`;
/// failures they can express are encoded in the result, errors they cannot
/// handle propagate and are converted to failed results upstream.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, arguments: Value) -> Result<ToolResult>;
}

struct Registered {
    schema: ToolSchema,
    dispatcher: Arc<dyn ToolDispatcher>,
}

/// Per-run tool catalog: builtins plus MCP proxies. Tools carry per-run
/// state (project ids, store handles), so a registry is built per worker
/// run rather than shared.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Registered>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema: ToolSchema, dispatcher: Arc<dyn ToolDispatcher>) {
        let name = schema.name.clone();
        if self
            .tools
            .write()
            .insert(name.clone(), Registered { schema, dispatcher })
            .is_some()
        {
            tracing::warn!(tool = %name, "tool registered twice, replacing");
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn schema(&self, name: &str) -> Option<ToolSchema> {
        self.tools.read().get(name).map(|r| r.schema.clone())
    }

    /// Whether a successful call of this tool ends the run.
    pub fn terminates_run(&self, name: &str) -> bool {
        self.tools
            .read()
            .get(name)
            .map(|r| r.schema.terminates_run)
            .unwrap_or(false)
    }

    /// All schemas, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> =
            self.tools.read().values().map(|r| r.schema.clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// OpenAPI function declarations for native function-calling models.
    pub fn openapi_tools(&self) -> Vec<Value> {
        self.schemas().iter().map(ToolSchema::to_openapi).collect()
    }

    /// XML bindings for tools reachable through the XML path.
    pub fn xml_bindings(&self) -> Vec<(String, XmlBindings)> {
        self.schemas()
            .into_iter()
            .filter_map(|s| s.xml_bindings.clone().map(|b| (s.name, b)))
            .collect()
    }

    /// Map an XML tag name back to the registered tool name.
    pub fn tool_for_xml_tag(&self, tag: &str) -> Option<String> {
        let tools = self.tools.read();
        // Exact tool name wins; otherwise match declared tag names.
        if tools.contains_key(tag) {
            return Some(tag.to_string());
        }
        tools
            .values()
            .find(|r| {
                r.schema
                    .xml_bindings
                    .as_ref()
                    .is_some_and(|b| b.tag_name == tag)
            })
            .map(|r| r.schema.name.clone())
    }

    /// Dispatch a call by registered name.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let dispatcher = {
            let tools = self.tools.read();
            let registered = tools
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("tool {name}")))?;
            Arc::clone(&registered.dispatcher)
        };
        dispatcher.dispatch(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ToolDispatcher for EchoTool {
        async fn dispatch(&self, arguments: Value) -> Result<ToolResult> {
            Ok(ToolResult::ok(arguments))
        }
    }

    fn echo_schema(name: &str) -> ToolSchema {
        ToolSchema::builtin(
            name,
            "Echo the arguments back",
            serde_json::json!({ "type": "object" }),
        )
    }

    #[tokio::test]
    async fn register_and_dispatch() {
        let registry = ToolRegistry::new();
        registry.register(echo_schema("echo"), Arc::new(EchoTool));

        assert!(registry.has("echo"));
        let result = registry
            .dispatch("echo", serde_json::json!({ "x": 1 }))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["x"], 1);
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let err = registry
            .dispatch("missing", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn openapi_rendering_sorted() {
        let registry = ToolRegistry::new();
        registry.register(echo_schema("zeta"), Arc::new(EchoTool));
        registry.register(echo_schema("alpha"), Arc::new(EchoTool));

        let tools = registry.openapi_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["function"]["name"], "alpha");
        assert_eq!(tools[1]["function"]["name"], "zeta");
    }

    #[test]
    fn xml_tag_resolution() {
        use skein_domain::tool::XmlBindings;
        let registry = ToolRegistry::new();
        let schema = echo_schema("str_replace").with_xml(XmlBindings {
            tag_name: "str-replace".into(),
            params: vec![],
        });
        registry.register(schema, Arc::new(EchoTool));

        assert_eq!(
            registry.tool_for_xml_tag("str-replace").as_deref(),
            Some("str_replace")
        );
        assert_eq!(
            registry.tool_for_xml_tag("str_replace").as_deref(),
            Some("str_replace")
        );
        assert!(registry.tool_for_xml_tag("unknown").is_none());
    }

    #[test]
    fn terminal_flag_lookup() {
        let registry = ToolRegistry::new();
        registry.register(echo_schema("ask").terminal(), Arc::new(EchoTool));
        registry.register(echo_schema("shell"), Arc::new(EchoTool));

        assert!(registry.terminates_run("ask"));
        assert!(!registry.terminates_run("shell"));
        assert!(!registry.terminates_run("missing"));
    }
}
