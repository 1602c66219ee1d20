//! Shell execution inside the run's sandbox.

use std::sync::Arc;

use serde_json::Value;

use relay_domain::cancel::CancelToken;
use relay_domain::error::{Error, Result};
use relay_domain::tool::{XmlMapping, XmlSpec};
use relay_sandbox::SandboxProvider;

use crate::registry::{ToolContext, ToolHandler, ToolSpec};

struct ExecuteCommand {
    sandbox: Arc<dyn SandboxProvider>,
}

#[async_trait::async_trait]
impl ToolHandler for ExecuteCommand {
    async fn invoke(&self, ctx: &ToolContext, arguments: Value, cancel: &CancelToken) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let sandbox_id = ctx
            .sandbox_id
            .as_deref()
            .ok_or_else(|| Error::ToolFailure("no sandbox is provisioned for this run".into()))?;
        let command = arguments
            .get("command")
            .and_then(|v| v.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::ToolFailure("missing required parameter: command".into()))?;

        let output = self.sandbox.exec(sandbox_id, command).await?;
        Ok(serde_json::json!({
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
        }))
    }
}

pub fn execute_command_spec(sandbox: Arc<dyn SandboxProvider>) -> ToolSpec {
    ToolSpec {
        name: "execute_command".into(),
        description: "Run a shell command inside the sandbox and return its output.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to execute" }
            },
            "required": ["command"]
        }),
        xml: Some(XmlSpec {
            tag: "execute-command".into(),
            mappings: vec![XmlMapping::content("command", true)],
            example: Some("<execute-command>ls -la</execute-command>".into()),
        }),
        handler: Arc::new(ExecuteCommand { sandbox }),
    }
}
