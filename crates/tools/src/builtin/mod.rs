//! Built-in tool set.
//!
//! Registered by [`register_builtins`] at startup: sandbox file
//! operations, shell execution, web search, and the terminal-intent tools
//! (`complete`, `ask`, `web-browser-takeover`) that end a run.

pub mod control;
pub mod files;
pub mod search;
pub mod shell;

use std::sync::Arc;

use relay_domain::error::Result;
use relay_sandbox::SandboxProvider;

use crate::registry::ToolRegistry;

/// Construct and register every built-in tool.
///
/// `search_endpoint` is the optional external data provider for
/// `web_search`; when absent the tool stays registered but reports itself
/// unavailable so the model can fall back to shell commands.
pub fn register_builtins(
    registry: &ToolRegistry,
    sandbox: Arc<dyn SandboxProvider>,
    search_endpoint: Option<String>,
) -> Result<()> {
    registry.register(files::create_file_spec(sandbox.clone()))?;
    registry.register(files::read_file_spec(sandbox.clone()))?;
    registry.register(files::delete_file_spec(sandbox.clone()))?;
    registry.register(files::list_dir_spec(sandbox.clone()))?;
    registry.register(shell::execute_command_spec(sandbox))?;
    registry.register(search::web_search_spec(search_endpoint))?;
    registry.register(control::complete_spec())?;
    registry.register(control::ask_spec())?;
    registry.register(control::browser_takeover_spec())?;
    Ok(())
}
