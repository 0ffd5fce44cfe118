// Core of dagbox: parallel DAG workflow execution over a tool boundary,
// with a resource-bounded code sandbox as the built-in tool

pub mod config;
pub mod error;
pub mod events;
pub mod sandbox;
pub mod tools;
pub mod types;
pub mod workflow;

pub use config::{EngineConfig, ExecutorConfig, ReplanPolicy, SandboxConfig};
pub use error::{ConfigError, ExecutorError, GraphError, SandboxError, SandboxErrorKind, ToolError};
pub use events::{EventType, WorkflowEvent};
pub use sandbox::{CodeSandbox, MeteredAllocator, ScriptSandbox, SandboxResult};
pub use tools::{FnTool, SandboxTool, Tool, ToolExecutor, ToolRegistry};
pub use types::*;
pub use workflow::{TaskGraph, WorkflowExecutor};

#[cfg(test)]
#[global_allocator]
static ALLOC: MeteredAllocator = MeteredAllocator;
