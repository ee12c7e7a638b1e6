//! Tool calls, results and schemas — the contract between the response
//! processor, the tool registry and the MCP client pool.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a tool invocation was expressed by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSource {
    /// Provider-structured `tool_calls` field.
    Native,
    /// Inline `<invoke>` block in assistant text.
    Xml,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function_name: String,
    pub arguments: Value,
    pub source: CallSource,
    /// The raw text the call was parsed from (XML block or argument JSON).
    pub raw: String,
}

/// Outcome of dispatching one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: Value::String(error.clone()),
            error: Some(error),
        }
    }
}

/// A stored record of one call + its result, persisted as the content of
/// `tool` messages and `tool` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub function_name: String,
    pub call_id: String,
    pub arguments: Value,
    pub result: ToolResult,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool schemas
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Origin of a registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSource {
    Builtin,
    Mcp { qualified_name: String },
}

/// How a `<parameter>` value is coerced into the JSON argument object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamCoercion {
    /// JSON-looking strings are decoded, `true`/`false` become bools, bare
    /// numbers become numeric, everything else stays a string.
    #[default]
    Auto,
    /// Always keep the raw string.
    String,
}

/// Binding of one XML `<parameter>` to an argument field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlParamBinding {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub coercion: ParamCoercion,
}

/// XML invocation metadata for tools reachable through the XML path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlBindings {
    /// The name used in `<invoke name="...">` (and, for the legacy shape,
    /// the tag name itself).
    pub tag_name: String,
    #[serde(default)]
    pub params: Vec<XmlParamBinding>,
}

/// The schema half of a registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON-Schema fragment for the argument object.
    pub input_schema: Value,
    pub source: ToolSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xml_bindings: Option<XmlBindings>,
    /// When true, a successful call ends the run (e.g. `ask`, `complete`).
    #[serde(default)]
    pub terminates_run: bool,
}

impl ToolSchema {
    pub fn builtin(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            source: ToolSource::Builtin,
            xml_bindings: None,
            terminates_run: false,
        }
    }

    pub fn terminal(mut self) -> Self {
        self.terminates_run = true;
        self
    }

    pub fn with_xml(mut self, bindings: XmlBindings) -> Self {
        self.xml_bindings = Some(bindings);
        self
    }

    /// OpenAPI function shape for native function-calling providers.
    pub fn to_openapi(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}
