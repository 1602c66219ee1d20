//! Terminal-intent tools.
//!
//! Invoking any of these signals the end of an agent run: `complete`
//! declares the task finished, `ask` hands the turn back to the user with
//! a question, and `web-browser-takeover` requests a human to drive the
//! sandbox browser. The thread loop breaks after their results persist.

use std::sync::Arc;

use serde_json::Value;

use relay_domain::cancel::CancelToken;
use relay_domain::error::Result;
use relay_domain::tool::{XmlMapping, XmlSpec, XmlValueType};

use crate::registry::{ToolContext, ToolHandler, ToolSpec};

/// Tool names whose successful result terminates the run loop.
pub const TERMINAL_TOOLS: &[&str] = &["complete", "ask", "web-browser-takeover"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// complete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Complete;

#[async_trait::async_trait]
impl ToolHandler for Complete {
    async fn invoke(&self, _ctx: &ToolContext, arguments: Value, _cancel: &CancelToken) -> Result<Value> {
        let mut payload = serde_json::json!({ "status": "complete" });
        if let Some(text) = arguments.get("text").and_then(|v| v.as_str()) {
            if !text.trim().is_empty() {
                payload["text"] = Value::String(text.trim().to_owned());
            }
        }
        Ok(payload)
    }
}

pub fn complete_spec() -> ToolSpec {
    ToolSpec {
        name: "complete".into(),
        description: "Declare the task finished. Call when every requested step is done.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Optional closing summary" }
            }
        }),
        xml: Some(XmlSpec {
            tag: "complete".into(),
            mappings: vec![XmlMapping::text("text", false)],
            example: Some("<complete>All steps finished.</complete>".into()),
        }),
        handler: Arc::new(Complete),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ask
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Ask;

#[async_trait::async_trait]
impl ToolHandler for Ask {
    async fn invoke(&self, _ctx: &ToolContext, arguments: Value, _cancel: &CancelToken) -> Result<Value> {
        let text = arguments.get("text").and_then(|v| v.as_str()).unwrap_or("").trim().to_owned();
        let attachments: Vec<String> = arguments
            .get("attachments")
            .and_then(|v| v.as_str())
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(serde_json::json!({
            "status": "awaiting_user_input",
            "text": text,
            "attachments": attachments,
        }))
    }
}

pub fn ask_spec() -> ToolSpec {
    ToolSpec {
        name: "ask".into(),
        description: "Ask the user a question and wait for their reply. Ends the current run.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "The question to ask" },
                "attachments": {
                    "type": "string",
                    "description": "Comma-separated workspace file paths to show the user"
                }
            },
            "required": ["text"]
        }),
        xml: Some(XmlSpec {
            tag: "ask".into(),
            mappings: vec![
                XmlMapping::attribute("attachments", XmlValueType::String, false),
                XmlMapping::content("text", true),
            ],
            example: Some("<ask attachments=\"report.md\">Should I publish the report?</ask>".into()),
        }),
        handler: Arc::new(Ask),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// web-browser-takeover
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct BrowserTakeover;

#[async_trait::async_trait]
impl ToolHandler for BrowserTakeover {
    async fn invoke(&self, _ctx: &ToolContext, arguments: Value, _cancel: &CancelToken) -> Result<Value> {
        let text = arguments.get("text").and_then(|v| v.as_str()).unwrap_or("").trim().to_owned();
        Ok(serde_json::json!({
            "status": "browser_takeover_requested",
            "text": text,
        }))
    }
}

pub fn browser_takeover_spec() -> ToolSpec {
    ToolSpec {
        name: "web-browser-takeover".into(),
        description: "Hand browser control to the user, e.g. for a login or captcha. Ends the current run.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "What the user should do in the browser" }
            },
            "required": ["text"]
        }),
        xml: Some(XmlSpec {
            tag: "web-browser-takeover".into(),
            mappings: vec![XmlMapping::content("text", true)],
            example: Some("<web-browser-takeover>Please complete the login form.</web-browser-takeover>".into()),
        }),
        handler: Arc::new(BrowserTakeover),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_reports_status() {
        let spec = complete_spec();
        let out = spec
            .handler
            .invoke(&ToolContext::default(), serde_json::json!({}), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({ "status": "complete" }));
    }

    #[tokio::test]
    async fn complete_includes_trimmed_text() {
        let spec = complete_spec();
        let out = spec
            .handler
            .invoke(
                &ToolContext::default(),
                serde_json::json!({ "text": "  done  " }),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["text"], serde_json::json!("done"));
    }

    #[tokio::test]
    async fn ask_splits_attachments() {
        let spec = ask_spec();
        let out = spec
            .handler
            .invoke(
                &ToolContext::default(),
                serde_json::json!({ "text": "Question?", "attachments": "a.txt, b.jpg" }),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["status"], serde_json::json!("awaiting_user_input"));
        assert_eq!(out["attachments"], serde_json::json!(["a.txt", "b.jpg"]));
    }

    #[tokio::test]
    async fn ask_without_attachments() {
        let spec = ask_spec();
        let out = spec
            .handler
            .invoke(
                &ToolContext::default(),
                serde_json::json!({ "text": "Q" }),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["attachments"], serde_json::json!([]));
    }

    #[test]
    fn terminal_tool_names_are_stable() {
        assert!(TERMINAL_TOOLS.contains(&"complete"));
        assert!(TERMINAL_TOOLS.contains(&"ask"));
        assert!(TERMINAL_TOOLS.contains(&"web-browser-takeover"));
    }
}
