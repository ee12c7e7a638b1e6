//! Streaming parser for inline XML tool invocations.
//!
//! Models without native function calling emit blocks of the form:
//!
//! ```text
//! <function_calls>
//! <invoke name="TOOL_NAME">
//! <parameter name="P1">value1</parameter>
//! </invoke>
//! </function_calls>
//! ```
//!
//! The parser is fed raw deltas and returns calls as soon as their
//! `</invoke>` arrives; a residual tail carries constructs split across
//! chunk boundaries. A legacy single-tag shape
//! `<tool-name attr="v">body</tool-name>` is accepted for registered tags.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn invoke_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<invoke\s+name=["']([^"']+)["']\s*>(.*?)</invoke>"#).expect("invoke regex")
    })
}

fn parameter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<parameter\s+name=["']([^"']+)["']\s*>(.*?)</parameter>"#)
            .expect("parameter regex")
    })
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*["']([^"']*)["']"#).expect("attr regex")
    })
}

/// A parsed XML tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlToolCall {
    pub function_name: String,
    /// Parameter name → coerced value. Ordered for stable formatting.
    pub parameters: BTreeMap<String, Value>,
    /// The exact text the call was parsed from.
    pub raw_xml: String,
}

impl XmlToolCall {
    /// Normalized rendering: one parameter per line, double quotes,
    /// structured values as compact JSON.
    pub fn format(&self) -> String {
        let mut out = format!("<invoke name=\"{}\">\n", self.function_name);
        for (name, value) in &self.parameters {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("<parameter name=\"{name}\">{rendered}</parameter>\n"));
        }
        out.push_str("</invoke>");
        out
    }
}

/// Heuristic value coercion: JSON-looking strings decode to structured
/// values, `true`/`false` to bools, bare numbers to numbers, everything
/// else stays a trimmed string.
pub fn coerce_parameter_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            return parsed;
        }
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(float) {
            return Value::Number(num);
        }
    }
    Value::String(trimmed.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Incremental parser state: a residual buffer plus the set of legacy tag
/// names it may treat as tool calls.
pub struct StreamingXmlParser {
    buffer: String,
    legacy_tags: Vec<String>,
}

impl StreamingXmlParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            legacy_tags: Vec::new(),
        }
    }

    /// Accept the legacy `<tag ...>body</tag>` shape for these tag names.
    pub fn with_legacy_tags(mut self, tags: Vec<String>) -> Self {
        self.legacy_tags = tags;
        self
    }

    /// Current residual (incomplete tail kept across chunks).
    pub fn residual(&self) -> &str {
        &self.buffer
    }

    /// Feed one delta; returns every call completed by it, in order of
    /// appearance.
    pub fn push(&mut self, delta: &str) -> Vec<XmlToolCall> {
        self.buffer.push_str(delta);
        let mut calls = Vec::new();

        loop {
            match self.extract_next_call() {
                Some(call) => calls.push(call),
                None => break,
            }
        }

        self.trim_residual();
        calls
    }

    /// Parse a complete buffer in one shot.
    pub fn parse_complete(text: &str, legacy_tags: Vec<String>) -> Vec<XmlToolCall> {
        let mut parser = Self::new().with_legacy_tags(legacy_tags);
        parser.push(text)
    }

    /// Find the earliest completed invocation (either shape), remove it
    /// and everything before it from the buffer.
    fn extract_next_call(&mut self) -> Option<XmlToolCall> {
        let invoke = invoke_re().captures(&self.buffer).map(|caps| {
            let all = caps.get(0).expect("whole match");
            (all.start(), all.end(), parse_invoke(&caps))
        });

        let legacy = self.find_legacy_call();

        let (start, end, call) = match (invoke, legacy) {
            (Some(a), Some(b)) => {
                if a.0 <= b.0 {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return None,
        };

        debug_assert!(start <= end);
        self.buffer.drain(..end);
        Some(call)
    }

    fn find_legacy_call(&self) -> Option<(usize, usize, XmlToolCall)> {
        let mut best: Option<(usize, usize, XmlToolCall)> = None;
        for tag in &self.legacy_tags {
            let re = legacy_re(tag);
            if let Some(caps) = re.captures(&self.buffer) {
                let all = caps.get(0).expect("whole match");
                let candidate = (all.start(), all.end(), parse_legacy(tag, &caps));
                if best.as_ref().is_none_or(|b| candidate.0 < b.0) {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    /// Drop buffered text that can no longer be part of a future call,
    /// keeping any unclosed construct and partial trailing tags.
    fn trim_residual(&mut self) {
        if let Some(pos) = self.unclosed_construct_start() {
            self.buffer.drain(..pos);
            return;
        }
        // A lone '<' tail may be a tag split across chunks.
        if let Some(pos) = self.buffer.rfind('<') {
            if !self.buffer[pos..].contains('>') {
                self.buffer.drain(..pos);
                return;
            }
        }
        self.buffer.clear();
    }

    fn unclosed_construct_start(&self) -> Option<usize> {
        let mut earliest: Option<usize> = None;
        let mut consider = |pos: Option<usize>| {
            if let Some(pos) = pos {
                earliest = Some(earliest.map_or(pos, |e: usize| e.min(pos)));
            }
        };

        consider(find_unclosed(&self.buffer, "<invoke", "</invoke>"));
        // An open block wrapper alone is worth keeping: its first invoke
        // may still be streaming in.
        consider(find_unclosed(
            &self.buffer,
            "<function_calls",
            "</function_calls>",
        ));
        for tag in &self.legacy_tags {
            consider(find_unclosed(
                &self.buffer,
                &format!("<{tag}"),
                &format!("</{tag}>"),
            ));
        }
        earliest
    }
}

impl Default for StreamingXmlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of the last `open` occurrence with no matching `close` after
/// it.
fn find_unclosed(buffer: &str, open: &str, close: &str) -> Option<usize> {
    let open_pos = buffer.rfind(open)?;
    if buffer[open_pos..].contains(close) {
        None
    } else {
        Some(open_pos)
    }
}

fn legacy_re(tag: &str) -> Regex {
    let escaped = regex::escape(tag);
    Regex::new(&format!(
        r#"(?is)<{escaped}((?:\s+[A-Za-z_][\w-]*\s*=\s*["'][^"']*["'])*)\s*>(.*?)</{escaped}>"#
    ))
    .expect("legacy tag regex")
}

fn parse_invoke(caps: &regex::Captures<'_>) -> XmlToolCall {
    let function_name = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
    let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let raw_xml = caps.get(0).map(|m| m.as_str()).unwrap_or("").to_string();

    let mut parameters = BTreeMap::new();
    for param in parameter_re().captures_iter(body) {
        let name = param.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
        let value = param.get(2).map(|m| m.as_str()).unwrap_or("");
        parameters.insert(name, coerce_parameter_value(value));
    }

    XmlToolCall {
        function_name,
        parameters,
        raw_xml,
    }
}

fn parse_legacy(tag: &str, caps: &regex::Captures<'_>) -> XmlToolCall {
    let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let raw_xml = caps.get(0).map(|m| m.as_str()).unwrap_or("").to_string();

    let mut parameters = BTreeMap::new();
    for attr in attr_re().captures_iter(attrs) {
        let name = attr.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
        let value = attr.get(2).map(|m| m.as_str()).unwrap_or("");
        parameters.insert(name, coerce_parameter_value(value));
    }
    if !body.trim().is_empty() {
        parameters.insert("content".into(), Value::String(body.trim().to_string()));
    }

    XmlToolCall {
        function_name: tag.to_string(),
        parameters,
        raw_xml,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_invoke_with_parameters() {
        let text = r#"<function_calls>
<invoke name="shell">
<parameter name="cmd">echo hi</parameter>
<parameter name="timeout">30</parameter>
</invoke>
</function_calls>"#;
        let calls = StreamingXmlParser::parse_complete(text, vec![]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "shell");
        assert_eq!(calls[0].parameters["cmd"], "echo hi");
        assert_eq!(calls[0].parameters["timeout"], 30);
    }

    #[test]
    fn multiple_invokes_in_one_block() {
        let text = r#"<function_calls>
<invoke name="web_search"><parameter name="query">a</parameter></invoke>
<invoke name="web_search"><parameter name="query">b</parameter></invoke>
</function_calls>"#;
        let calls = StreamingXmlParser::parse_complete(text, vec![]);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].parameters["query"], "a");
        assert_eq!(calls[1].parameters["query"], "b");
    }

    #[test]
    fn interleaved_prose_is_ignored() {
        let text = r#"Let me check that for you.
<function_calls><invoke name="shell"><parameter name="cmd">ls</parameter></invoke></function_calls>
Working on it."#;
        let calls = StreamingXmlParser::parse_complete(text, vec![]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "shell");
    }

    #[test]
    fn both_quote_styles() {
        let text = r#"<invoke name='edit'><parameter name='path'>a.txt</parameter></invoke>"#;
        let calls = StreamingXmlParser::parse_complete(text, vec![]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].parameters["path"], "a.txt");
    }

    #[test]
    fn value_coercion() {
        assert_eq!(coerce_parameter_value("true"), Value::Bool(true));
        assert_eq!(coerce_parameter_value("false"), Value::Bool(false));
        assert_eq!(coerce_parameter_value("42"), Value::Number(42.into()));
        assert_eq!(coerce_parameter_value(" 3.5 "), serde_json::json!(3.5));
        assert_eq!(
            coerce_parameter_value(r#"{"a": [1, 2]}"#),
            serde_json::json!({ "a": [1, 2] })
        );
        assert_eq!(
            coerce_parameter_value("{not json}"),
            Value::String("{not json}".into())
        );
        assert_eq!(
            coerce_parameter_value("plain text"),
            Value::String("plain text".into())
        );
    }

    #[test]
    fn streaming_across_chunk_boundaries() {
        let mut parser = StreamingXmlParser::new();
        // The tag itself is split mid-name.
        assert!(parser.push("Here you go: <function_calls><inv").is_empty());
        assert!(parser.push("oke name=\"shell\"><parameter name=\"cmd\">ec").is_empty());
        let calls = parser.push("ho hi</parameter></invoke></function_calls>");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].parameters["cmd"], "echo hi");
    }

    #[test]
    fn call_completes_at_invoke_close_not_block_close() {
        let mut parser = StreamingXmlParser::new();
        let calls =
            parser.push("<function_calls><invoke name=\"a\"><parameter name=\"x\">1</parameter></invoke>");
        assert_eq!(calls.len(), 1);
        // The block is still open; the next invoke arrives later.
        let calls = parser.push("<invoke name=\"b\"><parameter name=\"x\">2</parameter></invoke></function_calls>");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "b");
    }

    #[test]
    fn legacy_tag_shape() {
        let text = r#"<str-replace path="a.txt">new contents</str-replace>"#;
        let calls = StreamingXmlParser::parse_complete(text, vec!["str-replace".into()]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "str-replace");
        assert_eq!(calls[0].parameters["path"], "a.txt");
        assert_eq!(calls[0].parameters["content"], "new contents");
    }

    #[test]
    fn legacy_tag_not_registered_is_plain_text() {
        let text = r#"<em>not a tool</em>"#;
        let calls = StreamingXmlParser::parse_complete(text, vec![]);
        assert!(calls.is_empty());
    }

    #[test]
    fn residual_clears_after_plain_text() {
        let mut parser = StreamingXmlParser::new();
        parser.push("just some prose with a < sign and more text>");
        assert!(parser.residual().is_empty());
    }

    #[test]
    fn residual_keeps_open_invoke() {
        let mut parser = StreamingXmlParser::new();
        parser.push("text <invoke name=\"shell\"><parameter name=\"cmd\">ls");
        assert!(parser.residual().starts_with("<invoke"));
    }

    #[test]
    fn format_parse_round_trip() {
        let original = r#"<invoke name="shell">
<parameter name="cmd">echo hi</parameter>
<parameter name="count">3</parameter>
</invoke>"#;
        let calls = StreamingXmlParser::parse_complete(original, vec![]);
        assert_eq!(calls.len(), 1);

        let formatted = calls[0].format();
        let reparsed = StreamingXmlParser::parse_complete(&formatted, vec![]);
        assert_eq!(reparsed.len(), 1);
        assert_eq!(reparsed[0].function_name, calls[0].function_name);
        assert_eq!(reparsed[0].parameters, calls[0].parameters);
        // Formatting is a fixed point.
        assert_eq!(reparsed[0].format(), formatted);
    }

    #[test]
    fn order_preserved_across_shapes() {
        let text = r#"<old-tool a="1">x</old-tool>
<invoke name="new_tool"><parameter name="b">2</parameter></invoke>"#;
        let calls = StreamingXmlParser::parse_complete(text, vec!["old-tool".into()]);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function_name, "old-tool");
        assert_eq!(calls[1].function_name, "new_tool");
    }
}
