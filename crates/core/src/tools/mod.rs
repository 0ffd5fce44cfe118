// Tool boundary between the workflow executor and whatever a task invokes

mod registry;
mod sandbox;

pub use registry::{FnTool, Tool, ToolRegistry};
pub use sandbox::{SandboxTool, EXECUTE_CODE_ALIASES, EXECUTE_CODE_TOOL};

use crate::error::ToolError;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Capability through which the executor invokes named tools.
///
/// The executor calls this once per task attempt and knows nothing about
/// what the tool does internally.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        args: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ToolError>;
}
