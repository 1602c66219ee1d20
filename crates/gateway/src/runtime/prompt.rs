//! System prompt assembly.
//!
//! The base instructions plus, per the thread's execution policy, the
//! JSON tool listing and the XML tag examples the model needs to know the
//! two calling conventions.

use relay_tools::ToolRegistry;

use super::dispatch::ExecutionPolicy;

const BASE_PROMPT: &str = "You are an autonomous agent operating inside an isolated sandbox. \
Work step by step toward the user's goal, invoking tools as needed. \
When the task is done call the `complete` tool; if you need input from \
the user call `ask`; if a browser step needs a human (login, captcha) \
call `web-browser-takeover`.";

pub fn build_system_prompt(registry: &ToolRegistry, policy: &ExecutionPolicy) -> String {
    let mut prompt = String::from(BASE_PROMPT);

    if policy.native_tool_calling {
        let names: Vec<String> = registry.json_definitions().iter().map(|d| d.name.clone()).collect();
        if !names.is_empty() {
            prompt.push_str("\n\nAvailable tools: ");
            prompt.push_str(&names.join(", "));
            prompt.push('.');
        }
    }

    if policy.xml_tool_calling {
        let examples = registry.xml_examples();
        if !examples.is_empty() {
            prompt.push_str(
                "\n\nTools may also be invoked with inline XML tags in your reply. \
                 Tag syntax examples:\n",
            );
            for example in examples {
                prompt.push_str("  ");
                prompt.push_str(&example);
                prompt.push('\n');
            }
        }
    }

    prompt
}
