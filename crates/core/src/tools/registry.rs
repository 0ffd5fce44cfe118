use super::ToolExecutor;
use crate::error::ToolError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A named tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Execute the tool with given arguments
    async fn call(
        &self,
        args: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ToolError>;
}

/// Tool registry dispatching calls by name
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    aliases: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Register a tool under its own name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!("Registered tool {}", name);
        self.tools.insert(name, tool);
    }

    /// Make `alias` resolve to the tool registered as `target`
    pub fn register_alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(alias.into(), target.into());
    }

    /// Get a tool by name or alias
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let resolved = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.tools.get(resolved).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered tool names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(
        &self,
        tool_name: &str,
        args: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ToolError> {
        let tool = self
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;
        tool.call(args, cancel).await
    }
}

/// Tool backed by an async closure receiving the arguments and the call's
/// cancellation token
pub struct FnTool<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Map<String, Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Map<String, Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        args: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ToolError> {
        (self.func)(args, cancel).await
    }
}
