//! Isolated, resource-bounded execution of code snippets.
//!
//! A [`CodeSandbox`] runs one snippet against an optional context value and
//! either returns the value of its final expression or a typed
//! [`SandboxError`]. Implementations hold no state between calls.

mod meter;
mod script;

pub use meter::MeteredAllocator;
pub use script::ScriptSandbox;

use crate::error::SandboxError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Outcome of one code execution
pub type SandboxResult = Result<Value, SandboxError>;

/// Name under which the context value is bound inside executed code
pub const CONTEXT_BINDING: &str = "context";

#[async_trait::async_trait]
pub trait CodeSandbox: Send + Sync {
    /// Execute `code` with `context` bound to [`CONTEXT_BINDING`].
    ///
    /// Cancelling `cancel` stops the execution within the sandbox's own
    /// timeout bound and yields a `Cancelled` failure.
    async fn execute(
        &self,
        code: &str,
        context: Option<Value>,
        cancel: CancellationToken,
    ) -> SandboxResult;
}
