use super::registry::{Tool, ToolRegistry};
use crate::error::ToolError;
use crate::sandbox::{CodeSandbox, CONTEXT_BINDING};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Canonical name of the code execution tool
pub const EXECUTE_CODE_TOOL: &str = "execute_code";

/// Other names workflows use for the code execution tool
pub const EXECUTE_CODE_ALIASES: &[&str] = &["sandbox_execute", "agentcards:execute_code"];

/// Exposes a [`CodeSandbox`] as a tool taking `{ code, context? }`
pub struct SandboxTool {
    sandbox: Arc<dyn CodeSandbox>,
}

impl SandboxTool {
    pub fn new(sandbox: Arc<dyn CodeSandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait::async_trait]
impl Tool for SandboxTool {
    fn name(&self) -> &str {
        EXECUTE_CODE_TOOL
    }

    async fn call(
        &self,
        mut args: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ToolError> {
        let code = match args.remove("code") {
            Some(Value::String(code)) => code,
            Some(other) => {
                return Err(ToolError::invalid_arguments(
                    EXECUTE_CODE_TOOL,
                    format!("`code` must be a string, got {}", type_name(&other)),
                ))
            }
            None => {
                return Err(ToolError::invalid_arguments(
                    EXECUTE_CODE_TOOL,
                    "missing `code`",
                ))
            }
        };

        let context = match args.remove(CONTEXT_BINDING) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value),
        };

        Ok(self.sandbox.execute(&code, context, cancel).await?)
    }
}

impl ToolRegistry {
    /// Register `sandbox` as the code execution tool and its aliases
    pub fn register_sandbox(&mut self, sandbox: Arc<dyn CodeSandbox>) {
        self.register(Arc::new(SandboxTool::new(sandbox)));
        for alias in EXECUTE_CODE_ALIASES {
            self.register_alias(*alias, EXECUTE_CODE_TOOL);
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
