use anyhow::{bail, Context, Result};
use dagbox_core::{
    ApprovalDecision, CodeSandbox, EngineConfig, ScriptSandbox, ToolRegistry, WorkflowExecutor,
    WorkflowSpec, WorkflowState, WorkflowStatus,
};
use serde_json::Value;
use std::io::{BufRead, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How approval requests are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    ApproveAll,
    DenyAll,
    Prompt,
}

impl ApprovalMode {
    pub fn from_flags(approve_all: bool, deny_all: bool) -> Self {
        match (approve_all, deny_all) {
            (true, _) => Self::ApproveAll,
            (_, true) => Self::DenyAll,
            _ => Self::Prompt,
        }
    }
}

pub fn load_workflow(path: &Path) -> Result<WorkflowSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse workflow {}", path.display()))
}

fn build_executor(config: &EngineConfig) -> Result<WorkflowExecutor> {
    let sandbox = ScriptSandbox::new(config.sandbox.clone())?;
    let mut registry = ToolRegistry::new();
    registry.register_sandbox(Arc::new(sandbox));
    tracing::debug!("Registered tools: {}", registry.names().join(", "));
    Ok(WorkflowExecutor::new(
        Arc::new(registry),
        config.executor.clone(),
    ))
}

pub async fn run_workflow(config: &EngineConfig, path: &Path, approvals: ApprovalMode) -> Result<()> {
    let spec = load_workflow(path)?;
    let executor = build_executor(config)?;
    let id = executor.submit(spec).await?;

    let state = loop {
        let state = executor.wait(id).await?;
        match state.status {
            WorkflowStatus::Paused => {
                let task = state
                    .pending_approval
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_default();
                let decision = decide(approvals, &task).await?;
                executor.respond_approval(id, decision).await?;
            }
            WorkflowStatus::Pending => {
                executor.continue_run(id).await?;
            }
            _ => break state,
        }
    };

    print_json(&serde_json::to_value(&state)?)?;
    finish(&state)
}

async fn decide(mode: ApprovalMode, task: &str) -> Result<ApprovalDecision> {
    match mode {
        ApprovalMode::ApproveAll => Ok(ApprovalDecision::Approve),
        ApprovalMode::DenyAll => Ok(ApprovalDecision::Deny),
        ApprovalMode::Prompt => {
            let task = task.to_string();
            tokio::task::spawn_blocking(move || prompt(&task)).await?
        }
    }
}

fn prompt(task: &str) -> Result<ApprovalDecision> {
    let mut stderr = std::io::stderr();
    write!(stderr, "Approve task {}? [y/N] ", task)?;
    stderr.flush()?;

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read approval answer")?;
    Ok(parse_answer(&answer))
}

fn parse_answer(answer: &str) -> ApprovalDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::Approve,
        _ => ApprovalDecision::Deny,
    }
}

fn finish(state: &WorkflowState) -> Result<()> {
    match state.status {
        WorkflowStatus::Completed => Ok(()),
        status => match &state.failure {
            Some(failure) => bail!("workflow {}: task {} {}", status, failure.task, failure.error),
            None => bail!("workflow {}", status),
        },
    }
}

pub async fn exec_code(config: &EngineConfig, code_path: &Path, context: Option<&str>) -> Result<()> {
    let code = read_code(code_path)?;
    let context = context
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--context is not valid JSON")?;

    let sandbox = ScriptSandbox::new(config.sandbox.clone())?;
    match sandbox.execute(&code, context, CancellationToken::new()).await {
        Ok(value) => print_json(&serde_json::json!({ "ok": true, "result": value })),
        Err(error) => {
            print_json(&serde_json::json!({ "ok": false, "error": error }))?;
            bail!("execution failed: {}", error)
        }
    }
}

fn read_code(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read code from stdin")?;
        return Ok(code);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn print_json(value: &Value) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagbox_core::TaskName;

    #[test]
    fn test_load_workflow_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tasks": {{"hello": {{"tool": "execute_code", "params": {{"code": "40 + 2"}}}}}}}}"#
        )
        .unwrap();

        let spec = load_workflow(file.path()).unwrap();
        assert_eq!(spec.tasks.len(), 1);
        assert_eq!(spec.tasks[&TaskName::new("hello")].tool, "execute_code");
    }

    #[test]
    fn test_load_workflow_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = load_workflow(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse workflow"));
    }

    #[test]
    fn test_approval_answers() {
        assert_eq!(parse_answer("y\n"), ApprovalDecision::Approve);
        assert_eq!(parse_answer(" YES "), ApprovalDecision::Approve);
        assert_eq!(parse_answer("\n"), ApprovalDecision::Deny);
        assert_eq!(
            ApprovalMode::from_flags(false, true),
            ApprovalMode::DenyAll
        );
    }

    #[tokio::test]
    async fn test_run_workflow_end_to_end() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tasks": {{
                "fetch": {{"tool": "execute_code", "params": {{"code": "[1, 2, 3]"}}}},
                "sum": {{"tool": "execute_code",
                         "params": {{"code": "let t = 0; for x in context.fetch {{ t += x; }} t"}},
                         "dependencies": ["fetch"]}}
            }}}}"#
        )
        .unwrap();

        let config = EngineConfig::default();
        run_workflow(&config, file.path(), ApprovalMode::DenyAll)
            .await
            .unwrap();
    }
}
