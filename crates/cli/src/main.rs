use anyhow::Result;
use clap::{Parser, Subcommand};
use dagbox_core::MeteredAllocator;
use std::path::PathBuf;

mod commands;

#[global_allocator]
static ALLOC: MeteredAllocator = MeteredAllocator;

#[derive(Parser, Debug)]
#[command(name = "dagbox")]
#[command(about = "Parallel DAG task executor with a sandboxed code tool", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DAGBOX_CONFIG", default_value = "dagbox.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a workflow file and print its final state
    Run {
        /// Workflow JSON: {"tasks": {name: {tool, params, dependencies}}, "context": {}}
        workflow: PathBuf,

        /// Approve every approval request without prompting
        #[arg(long, conflicts_with = "deny_all")]
        approve_all: bool,

        /// Deny every approval request without prompting
        #[arg(long)]
        deny_all: bool,

        /// Override executor.max_concurrent_tasks
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Execute one code snippet in the sandbox and print its result
    Exec {
        /// Code file, or `-` for stdin
        code: PathBuf,

        /// JSON value bound as `context`
        #[arg(long)]
        context: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries JSON only
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dagbox=info,dagbox_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut config = dagbox_core::EngineConfig::load(&args.config)?;

    match args.command {
        Command::Run {
            workflow,
            approve_all,
            deny_all,
            max_concurrent,
        } => {
            if let Some(max) = max_concurrent {
                config.executor.max_concurrent_tasks = max;
                config.validate()?;
            }
            let approvals = commands::ApprovalMode::from_flags(approve_all, deny_all);
            commands::run_workflow(&config, &workflow, approvals).await
        }
        Command::Exec { code, context } => {
            commands::exec_code(&config, &code, context.as_deref()).await
        }
    }
}
