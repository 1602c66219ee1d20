//! Tool call wire formats.
//!
//! A tool may be invoked through two calling conventions that operate over
//! the same LLM output stream: native JSON tool calls (OpenAI
//! chat-completions shape) and inline XML tags embedded in assistant text.
//! Both conventions normalize to [`ToolCall`] / [`ToolResult`].

use serde::{Deserialize, Serialize};

/// Which calling convention produced a [`ToolCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOrigin {
    Json,
    Xml,
}

/// A single parsed tool invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub origin: CallOrigin,
    /// Set when the raw arguments failed strict decoding/coercion. The
    /// dispatcher surfaces this as a failure result without invoking the
    /// handler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub argument_error: Option<String>,
}

impl ToolCall {
    pub fn json(call_id: impl Into<String>, tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            origin: CallOrigin::Json,
            argument_error: None,
        }
    }

    pub fn xml(call_id: impl Into<String>, tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            origin: CallOrigin::Xml,
            argument_error: None,
        }
    }
}

/// The outcome of one tool invocation, correlated to its call by `call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, payload: serde_json::Value) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            success: true,
            payload,
            error: None,
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            success: false,
            payload: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn skipped(call: &ToolCall) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            success: false,
            payload: serde_json::json!({ "skipped": true }),
            error: Some("tool execution disabled for this thread".into()),
        }
    }
}

/// Tool definition in the shape the LLM consumes (JSON convention).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// XML convention
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where an XML-mapped parameter is read from within a tag occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "node_type")]
pub enum XmlNode {
    /// A tag attribute: `<tag param="value">`.
    Attribute,
    /// The text of a child element addressed by path, e.g. `"./child"`.
    Element { path: String },
    /// The full inner text with surrounding whitespace trimmed.
    Text,
    /// The inner content verbatim, untrimmed.
    Content,
}

/// Declared type a raw XML string value is coerced into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XmlValueType {
    String,
    Int,
    Float,
    Boolean,
    Json,
}

/// Maps one XML node to one declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlMapping {
    pub param: String,
    #[serde(flatten)]
    pub node: XmlNode,
    pub value_type: XmlValueType,
    pub required: bool,
}

impl XmlMapping {
    pub fn attribute(param: impl Into<String>, value_type: XmlValueType, required: bool) -> Self {
        Self { param: param.into(), node: XmlNode::Attribute, value_type, required }
    }

    pub fn element(param: impl Into<String>, path: impl Into<String>, value_type: XmlValueType, required: bool) -> Self {
        Self {
            param: param.into(),
            node: XmlNode::Element { path: path.into() },
            value_type,
            required,
        }
    }

    pub fn text(param: impl Into<String>, required: bool) -> Self {
        Self { param: param.into(), node: XmlNode::Text, value_type: XmlValueType::String, required }
    }

    pub fn content(param: impl Into<String>, required: bool) -> Self {
        Self { param: param.into(), node: XmlNode::Content, value_type: XmlValueType::String, required }
    }
}

/// The XML face of a tool: its tag, parameter mappings, and the usage
/// example rendered into the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlSpec {
    pub tag: String,
    pub mappings: Vec<XmlMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

/// Coerce a raw XML string value into the declared parameter type.
pub fn coerce_xml_value(value_type: XmlValueType, raw: &str) -> std::result::Result<serde_json::Value, String> {
    match value_type {
        XmlValueType::String => Ok(serde_json::Value::String(raw.to_owned())),
        XmlValueType::Int => raw
            .trim()
            .parse::<i64>()
            .map(serde_json::Value::from)
            .map_err(|e| format!("expected integer, got {raw:?}: {e}")),
        XmlValueType::Float => raw
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("expected float, got {raw:?}: {e}"))
            .and_then(|f| {
                serde_json::Number::from_f64(f)
                    .map(serde_json::Value::Number)
                    .ok_or_else(|| format!("non-finite float {raw:?}"))
            }),
        XmlValueType::Boolean => match raw.trim() {
            "true" | "True" | "1" => Ok(serde_json::Value::Bool(true)),
            "false" | "False" | "0" => Ok(serde_json::Value::Bool(false)),
            other => Err(format!("expected boolean, got {other:?}")),
        },
        XmlValueType::Json => {
            serde_json::from_str(raw).map_err(|e| format!("expected JSON, got {raw:?}: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_correlates_by_call_id() {
        let call = ToolCall::json("call_1", "search", serde_json::json!({"query": "a"}));
        let result = ToolResult::ok(&call, serde_json::json!({"hits": 3}));
        assert_eq!(result.call_id, call.call_id);
        assert!(result.success);
        assert!(result.error.is_none());
    }

    #[test]
    fn failure_carries_error() {
        let call = ToolCall::xml("xml-ask-0", "ask", serde_json::json!({}));
        let result = ToolResult::failure(&call, "missing required parameter: text");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("missing required parameter: text"));
    }

    #[test]
    fn skipped_is_marked() {
        let call = ToolCall::json("c", "exec", serde_json::json!({}));
        let result = ToolResult::skipped(&call);
        assert_eq!(result.payload["skipped"], serde_json::json!(true));
    }

    #[test]
    fn coerce_string() {
        assert_eq!(
            coerce_xml_value(XmlValueType::String, "a.txt,b.jpg").unwrap(),
            serde_json::json!("a.txt,b.jpg")
        );
    }

    #[test]
    fn coerce_int() {
        assert_eq!(coerce_xml_value(XmlValueType::Int, " 42 ").unwrap(), serde_json::json!(42));
        assert!(coerce_xml_value(XmlValueType::Int, "forty-two").is_err());
    }

    #[test]
    fn coerce_float() {
        assert_eq!(coerce_xml_value(XmlValueType::Float, "2.5").unwrap(), serde_json::json!(2.5));
        assert!(coerce_xml_value(XmlValueType::Float, "NaN").is_err());
    }

    #[test]
    fn coerce_boolean() {
        assert_eq!(coerce_xml_value(XmlValueType::Boolean, "true").unwrap(), serde_json::json!(true));
        assert_eq!(coerce_xml_value(XmlValueType::Boolean, "0").unwrap(), serde_json::json!(false));
        assert!(coerce_xml_value(XmlValueType::Boolean, "yes").is_err());
    }

    #[test]
    fn coerce_json() {
        assert_eq!(
            coerce_xml_value(XmlValueType::Json, r#"{"k": [1, 2]}"#).unwrap(),
            serde_json::json!({"k": [1, 2]})
        );
        assert!(coerce_xml_value(XmlValueType::Json, "{broken").is_err());
    }

    #[test]
    fn origin_serializes_lowercase() {
        let call = ToolCall::xml("xml-ask-0", "ask", serde_json::json!({}));
        let v = serde_json::to_value(&call).unwrap();
        assert_eq!(v["origin"], serde_json::json!("xml"));
        // No argument_error key when absent.
        assert!(v.get("argument_error").is_none());
    }
}
