//! Tool registry and the built-in tool set exposed to the LLM.
//!
//! Each tool is a plain descriptor — name, JSON parameter schema, optional
//! XML face, and a boxed handler. The registry indexes descriptors by
//! function name (JSON convention) and by tag (XML convention). No
//! reflection, no inheritance: tools needing sandbox access hold the
//! provider handle directly.

pub mod builtin;
pub mod registry;

pub use registry::{ToolContext, ToolHandler, ToolRegistry, ToolSpec};
