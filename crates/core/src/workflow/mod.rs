pub mod dag;
pub mod executor;
pub mod references;
mod run;
mod task_runner;

pub use dag::TaskGraph;
pub use executor::WorkflowExecutor;
pub use references::OutputRef;
