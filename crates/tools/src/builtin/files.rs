//! Sandbox file tools: create, read, delete, and list.
//!
//! Every handler resolves the run's sandbox from [`ToolContext`]; a run
//! whose project has no sandbox gets a clean failure instead of a panic.

use std::sync::Arc;

use serde_json::Value;

use relay_domain::cancel::CancelToken;
use relay_domain::error::{Error, Result};
use relay_domain::tool::{XmlMapping, XmlSpec, XmlValueType};
use relay_sandbox::SandboxProvider;

use crate::registry::{ToolContext, ToolHandler, ToolSpec};

fn require_sandbox<'a>(ctx: &'a ToolContext) -> Result<&'a str> {
    ctx.sandbox_id
        .as_deref()
        .ok_or_else(|| Error::ToolFailure("no sandbox is provisioned for this run".into()))
}

fn require_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::ToolFailure(format!("missing required parameter: {key}")))
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// create_file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CreateFile {
    sandbox: Arc<dyn SandboxProvider>,
}

#[async_trait::async_trait]
impl ToolHandler for CreateFile {
    async fn invoke(&self, ctx: &ToolContext, arguments: Value, cancel: &CancelToken) -> Result<Value> {
        check_cancel(cancel)?;
        let sandbox_id = require_sandbox(ctx)?;
        let path = require_str(&arguments, "path")?;
        let contents = arguments.get("contents").and_then(|v| v.as_str()).unwrap_or("");

        self.sandbox.write_file(sandbox_id, path, contents.as_bytes()).await?;
        Ok(serde_json::json!({ "path": path, "bytes_written": contents.len() }))
    }
}

pub fn create_file_spec(sandbox: Arc<dyn SandboxProvider>) -> ToolSpec {
    ToolSpec {
        name: "create_file".into(),
        description: "Create or overwrite a file in the sandbox workspace.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" },
                "contents": { "type": "string", "description": "Full file contents" }
            },
            "required": ["path"]
        }),
        xml: Some(XmlSpec {
            tag: "create-file".into(),
            mappings: vec![
                XmlMapping::attribute("path", XmlValueType::String, true),
                XmlMapping::content("contents", false),
            ],
            example: Some("<create-file path=\"notes.md\">file contents here</create-file>".into()),
        }),
        handler: Arc::new(CreateFile { sandbox }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// read_file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ReadFile {
    sandbox: Arc<dyn SandboxProvider>,
}

#[async_trait::async_trait]
impl ToolHandler for ReadFile {
    async fn invoke(&self, ctx: &ToolContext, arguments: Value, cancel: &CancelToken) -> Result<Value> {
        check_cancel(cancel)?;
        let sandbox_id = require_sandbox(ctx)?;
        let path = require_str(&arguments, "path")?;

        let bytes = self.sandbox.read_file(sandbox_id, path).await?;
        let contents = String::from_utf8_lossy(&bytes).into_owned();
        Ok(serde_json::json!({ "path": path, "contents": contents }))
    }
}

pub fn read_file_spec(sandbox: Arc<dyn SandboxProvider>) -> ToolSpec {
    ToolSpec {
        name: "read_file".into(),
        description: "Read a file from the sandbox workspace.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" }
            },
            "required": ["path"]
        }),
        xml: Some(XmlSpec {
            tag: "read-file".into(),
            mappings: vec![XmlMapping::attribute("path", XmlValueType::String, true)],
            example: Some("<read-file path=\"notes.md\"></read-file>".into()),
        }),
        handler: Arc::new(ReadFile { sandbox }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// delete_file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct DeleteFile {
    sandbox: Arc<dyn SandboxProvider>,
}

#[async_trait::async_trait]
impl ToolHandler for DeleteFile {
    async fn invoke(&self, ctx: &ToolContext, arguments: Value, cancel: &CancelToken) -> Result<Value> {
        check_cancel(cancel)?;
        let sandbox_id = require_sandbox(ctx)?;
        let path = require_str(&arguments, "path")?;

        self.sandbox.delete_file(sandbox_id, path).await?;
        Ok(serde_json::json!({ "path": path, "deleted": true }))
    }
}

pub fn delete_file_spec(sandbox: Arc<dyn SandboxProvider>) -> ToolSpec {
    ToolSpec {
        name: "delete_file".into(),
        description: "Delete a file from the sandbox workspace.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" }
            },
            "required": ["path"]
        }),
        xml: None,
        handler: Arc::new(DeleteFile { sandbox }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// list_dir
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ListDir {
    sandbox: Arc<dyn SandboxProvider>,
}

#[async_trait::async_trait]
impl ToolHandler for ListDir {
    async fn invoke(&self, ctx: &ToolContext, arguments: Value, cancel: &CancelToken) -> Result<Value> {
        check_cancel(cancel)?;
        let sandbox_id = require_sandbox(ctx)?;
        let path = arguments.get("path").and_then(|v| v.as_str()).unwrap_or(".");

        let entries = self.sandbox.list_dir(sandbox_id, path).await?;
        Ok(serde_json::json!({ "path": path, "entries": entries }))
    }
}

pub fn list_dir_spec(sandbox: Arc<dyn SandboxProvider>) -> ToolSpec {
    ToolSpec {
        name: "list_dir".into(),
        description: "List a directory in the sandbox workspace.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path, defaults to the workspace root" }
            }
        }),
        xml: None,
        handler: Arc::new(ListDir { sandbox }),
    }
}
