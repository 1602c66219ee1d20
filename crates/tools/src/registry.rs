//! The authoritative set of tool specifications available to a thread.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use relay_domain::cancel::CancelToken;
use relay_domain::error::{Error, Result};
use relay_domain::tool::{ToolDefinition, XmlSpec};

/// Per-invocation context handed to every tool handler.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// The sandbox bound to the run's project, when one exists.
    pub sandbox_id: Option<String>,
    pub run_id: Option<uuid::Uuid>,
    pub thread_id: Option<uuid::Uuid>,
}

/// A tool implementation. Handlers must respect the cancellation token at
/// their own suspension points and report failures as `Err` — the
/// dispatcher converts those into failure results, never a crashed run.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, ctx: &ToolContext, arguments: Value, cancel: &CancelToken) -> Result<Value>;
}

/// Immutable tool descriptor. Registered once at startup.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
    /// The XML calling convention, when the tool exposes one.
    pub xml: Option<XmlSpec>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("xml_tag", &self.xml.as_ref().map(|x| &x.tag))
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read-mostly registry. Registration is serialized behind the write
/// lock and happens at startup; lookups take the read path.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, Arc<ToolSpec>>,
    by_tag: HashMap<String, Arc<ToolSpec>>,
    /// Registration order, for deterministic schema listings.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails with `Conflict` when either the name or the
    /// XML tag is already taken.
    pub fn register(&self, spec: ToolSpec) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.by_name.contains_key(&spec.name) {
            return Err(Error::Conflict(format!("tool {:?} already registered", spec.name)));
        }
        if let Some(xml) = &spec.xml {
            if inner.by_tag.contains_key(&xml.tag) {
                return Err(Error::Conflict(format!("xml tag {:?} already registered", xml.tag)));
            }
        }

        let spec = Arc::new(spec);
        if let Some(xml) = &spec.xml {
            inner.by_tag.insert(xml.tag.clone(), spec.clone());
        }
        inner.order.push(spec.name.clone());
        inner.by_name.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<ToolSpec>> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn lookup_by_tag(&self, tag: &str) -> Option<Arc<ToolSpec>> {
        self.inner.read().by_tag.get(tag).cloned()
    }

    /// All registered XML tags; feeds the response parser's scanner.
    pub fn xml_tags(&self) -> Vec<String> {
        self.inner.read().by_tag.keys().cloned().collect()
    }

    /// JSON-convention definitions, in registration order. Used for the
    /// LLM request and the system prompt.
    pub fn json_definitions(&self) -> Vec<ToolDefinition> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.by_name.get(name))
            .map(|spec| spec.definition())
            .collect()
    }

    /// XML usage examples, in registration order. Rendered into the
    /// system prompt so the model knows the tag syntax.
    pub fn xml_examples(&self) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.by_name.get(name))
            .filter_map(|spec| spec.xml.as_ref())
            .filter_map(|xml| xml.example.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
