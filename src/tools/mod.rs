//! Tool system for chatrelay
//!
//! This module defines the tool abstraction offered to models during a round:
//! a [`Tool`] trait for individual handlers, a [`ToolContext`] carrying
//! per-round information into executions, and a [`ToolRegistry`] that resolves
//! reassembled tool calls by name and renders the function specs advertised
//! to the provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;

pub mod builtin;

pub use builtin::{ClockTool, EchoTool};

/// Trait for tools that models can invoke.
///
/// Tools are registered with a [`ToolRegistry`] and executed when a streamed
/// response requests them. Arguments arrive as the JSON object the model
/// produced; the returned string is fed back to the model as the tool result.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, matched against reassembled call descriptors.
    fn name(&self) -> &str;

    /// One-line description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value;

    /// Run the tool.
    ///
    /// # Errors
    ///
    /// Implementations return an error for invalid arguments or execution
    /// failure; the engine abandons the call and the round continues.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String>;
}

/// Per-round context passed to every tool execution.
///
/// # Example
/// ```
/// use chatrelay::tools::ToolContext;
///
/// let ctx = ToolContext::new().with_user("alice").with_workspace("/tmp");
/// assert_eq!(ctx.user_id.as_deref(), Some("alice"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// The user whose round triggered the execution.
    pub user_id: Option<String>,
    /// Working directory for tools that touch the filesystem.
    pub workspace: Option<String>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }
}

/// Registry of tools available to a round.
///
/// Resolution is by exact name. The registry also renders the
/// `{"type": "function", ...}` spec list sent to the provider with each
/// request, in stable name order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(ClockTool));
        registry
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, in stable order.
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Function specs advertised to the provider.
    pub fn specs(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
