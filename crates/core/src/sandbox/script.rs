use super::meter::Meter;
use super::{CodeSandbox, SandboxResult, CONTEXT_BINDING};
use crate::config::SandboxConfig;
use crate::error::{ConfigError, SandboxError};
use rhai::{Dynamic, Engine, EvalAltResult, Scope, INT};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Operations between two deadline/cancellation checks
const PROGRESS_CHECK_INTERVAL: u64 = 128;

/// Extra time the worker thread gets past the timeout before it is declared stuck
const WATCHDOG_GRACE: Duration = Duration::from_millis(2_000);

/// Native stack for worker threads; script call depth is bounded separately
const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Variables alive at once across all call frames
const MAX_VARIABLES: usize = 4_096;

const TIMEOUT_TOKEN: INT = 1;
const CANCEL_TOKEN: INT = 2;
const MEMORY_TOKEN: INT = 3;

/// Code sandbox backed by an embedded Rhai engine.
///
/// Every call builds a fresh engine and scope on its own worker thread, so
/// nothing leaks between executions. The engine has no filesystem, network or
/// module access; `eval` is disabled. The wall-clock timeout and cancellation
/// are checked from the engine's progress callback. The memory limit bounds
/// the live heap bytes of the worker thread, as counted by
/// [`MeteredAllocator`](super::MeteredAllocator), and is checked after every
/// operation.
pub struct ScriptSandbox {
    config: SandboxConfig,
    healthy: AtomicBool,
    engine_setup: Option<fn(&mut Engine)>,
}

impl ScriptSandbox {
    /// Fails when the memory limit cannot be enforced because
    /// [`MeteredAllocator`](super::MeteredAllocator) is not the global allocator.
    pub fn new(config: SandboxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if !Meter::is_installed() {
            return Err(ConfigError::Invalid(
                "sandbox memory limits need MeteredAllocator as the global allocator".into(),
            ));
        }
        Ok(Self {
            config,
            healthy: AtomicBool::new(true),
            engine_setup: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_engine_setup(config: SandboxConfig, setup: fn(&mut Engine)) -> Self {
        Self {
            config,
            healthy: AtomicBool::new(true),
            engine_setup: Some(setup),
        }
    }

    /// False once the enforcement layer has failed; the instance then refuses
    /// further executions.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn validate_input(&self, code: &str, context: Option<&Value>) -> Result<(), SandboxError> {
        if code.trim().is_empty() {
            return Err(SandboxError::validation("code must not be empty"));
        }
        if code.len() > self.config.max_code_bytes {
            return Err(SandboxError::validation(format!(
                "code is {} bytes, limit is {}",
                code.len(),
                self.config.max_code_bytes
            )));
        }
        if let Some(context) = context {
            let size = serde_json::to_vec(context)
                .map_err(|e| SandboxError::validation(format!("context is not serializable: {}", e)))?
                .len();
            if size > self.config.memory_limit_bytes() {
                return Err(SandboxError::validation(format!(
                    "context is {} bytes, larger than the {} MB memory limit",
                    size, self.config.memory_limit_mb
                )));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CodeSandbox for ScriptSandbox {
    async fn execute(
        &self,
        code: &str,
        context: Option<Value>,
        cancel: CancellationToken,
    ) -> SandboxResult {
        if !self.is_healthy() {
            return Err(SandboxError::internal(
                "sandbox disabled after an enforcement failure",
            ));
        }
        self.validate_input(code, context.as_ref())?;
        if cancel.is_cancelled() {
            return Err(SandboxError::cancelled());
        }

        let config = self.config.clone();
        let setup = self.engine_setup;
        let code = code.to_string();
        let worker_token = cancel.child_token();
        let token = worker_token.clone();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(config.timeout_ms);
        let watchdog = Duration::from_millis(config.timeout_ms) + WATCHDOG_GRACE;

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("dagbox-sandbox".to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let _ = tx.send(run_script(&config, setup, &code, context, deadline, token));
            })
            .map_err(|e| SandboxError::internal(format!("failed to start sandbox worker: {}", e)))?;

        let result = match tokio::time::timeout(watchdog, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                tracing::error!("Sandbox worker crashed before reporting a result");
                Err(SandboxError::internal("sandbox worker crashed"))
            }
            Err(_) => {
                worker_token.cancel();
                tracing::error!(
                    "Sandbox worker ignored its {} ms deadline",
                    self.config.timeout_ms
                );
                Err(SandboxError::internal("sandbox worker did not stop at its deadline"))
            }
        };

        if matches!(&result, Err(e) if e.is_fatal()) {
            self.healthy.store(false, Ordering::SeqCst);
        }

        match &result {
            Ok(_) => tracing::debug!("Sandbox execution finished in {:?}", started.elapsed()),
            Err(e) => tracing::debug!(
                "Sandbox execution failed after {:?}: {}",
                started.elapsed(),
                e
            ),
        }

        result
    }
}

fn build_engine(config: &SandboxConfig, deadline: Instant, cancel: CancellationToken) -> Engine {
    let mut engine = Engine::new();

    // Single values may not exceed the limit on their own; the meter bounds the total
    let memory = config.memory_limit_bytes();
    let slots = (memory / std::mem::size_of::<Dynamic>()).max(1);
    engine.set_max_string_size(memory);
    engine.set_max_array_size(slots);
    engine.set_max_map_size(slots);
    engine.set_max_variables(MAX_VARIABLES);
    engine.set_max_call_levels(config.max_call_depth);
    engine.set_max_expr_depths(config.max_call_depth, config.max_call_depth);

    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.disable_symbol("eval");

    engine.on_print(|text| tracing::debug!(target: "dagbox::sandbox", "{}", text));
    engine.on_debug(|text, _source, pos| {
        tracing::debug!(target: "dagbox::sandbox", "{} @ {}", text, pos)
    });

    engine.on_progress(move |ops| {
        if Meter::live_bytes() > memory {
            return Some(Dynamic::from(MEMORY_TOKEN));
        }
        if ops % PROGRESS_CHECK_INTERVAL != 0 {
            return None;
        }
        if cancel.is_cancelled() {
            return Some(Dynamic::from(CANCEL_TOKEN));
        }
        if Instant::now() >= deadline {
            return Some(Dynamic::from(TIMEOUT_TOKEN));
        }
        None
    });

    engine
}

fn run_script(
    config: &SandboxConfig,
    setup: Option<fn(&mut Engine)>,
    code: &str,
    context: Option<Value>,
    deadline: Instant,
    cancel: CancellationToken,
) -> SandboxResult {
    let mut engine = build_engine(config, deadline, cancel);
    if let Some(setup) = setup {
        setup(&mut engine);
    }

    let ast = engine
        .compile(code)
        .map_err(|e| SandboxError::validation(format!("failed to compile code: {}", e)))?;

    // Everything the script holds from here on counts against the limit
    let _meter = Meter::start();

    let bound = match context {
        Some(value) => rhai::serde::to_dynamic(&value)
            .map_err(|e| SandboxError::validation(format!("context cannot be bound: {}", e)))?,
        None => Dynamic::UNIT,
    };

    let mut scope = Scope::new();
    scope.push_constant(CONTEXT_BINDING, bound);

    let output = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(|e| map_eval_error(*e, config))?;

    rhai::serde::from_dynamic::<Value>(&output).map_err(|e| {
        SandboxError::runtime(format!(
            "result of type {} is not representable as structured data: {}",
            output.type_name(),
            e
        ))
    })
}

fn map_eval_error(error: EvalAltResult, config: &SandboxConfig) -> SandboxError {
    match error {
        EvalAltResult::ErrorTerminated(token, _) => match token.as_int() {
            Ok(CANCEL_TOKEN) => SandboxError::cancelled(),
            Ok(MEMORY_TOKEN) => SandboxError::memory_exceeded(
                "live memory above the limit",
                config.memory_limit_mb,
            ),
            _ => SandboxError::timeout(config.timeout_ms),
        },
        EvalAltResult::ErrorDataTooLarge(what, _) => {
            SandboxError::memory_exceeded(format!("{} too large", what), config.memory_limit_mb)
        }
        EvalAltResult::ErrorStackOverflow(_) => {
            SandboxError::memory_exceeded("call stack depth exceeded", config.memory_limit_mb)
        }
        other => SandboxError::runtime(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxErrorKind;
    use serde_json::json;

    fn sandbox(timeout_ms: u64, memory_limit_mb: u64) -> ScriptSandbox {
        ScriptSandbox::new(SandboxConfig::new(timeout_ms, memory_limit_mb)).unwrap()
    }

    async fn run(sandbox: &ScriptSandbox, code: &str, context: Option<Value>) -> SandboxResult {
        sandbox.execute(code, context, CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_final_expression_is_result() {
        let sb = sandbox(5_000, 64);
        assert_eq!(run(&sb, "let x = 40; x + 2", None).await.unwrap(), json!(42));
        assert_eq!(
            run(&sb, "return #{ sum: 1 + 2, ok: true };", None).await.unwrap(),
            json!({ "sum": 3, "ok": true })
        );
        assert_eq!(run(&sb, "let x = 1;", None).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_context_binding() {
        let sb = sandbox(5_000, 64);
        let context = json!({ "fetch": { "data": [1, 2, 3, 4, 5] } });

        let doubled = run(&sb, "context.fetch.data.map(|x| x * 2)", Some(context))
            .await
            .unwrap();
        assert_eq!(doubled, json!([2, 4, 6, 8, 10]));

        let sum = run(
            &sb,
            "let total = 0; for n in context.numbers { total += n; } total",
            Some(json!({ "numbers": [10, 25, 30] })),
        )
        .await
        .unwrap();
        assert_eq!(sum, json!(65));
    }

    #[tokio::test]
    async fn test_thrown_error_is_runtime_error() {
        let sb = sandbox(5_000, 64);
        let err = run(&sb, r#"throw "boom""#, None).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::RuntimeError);
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_invalid_input_is_validation_error() {
        let sb = sandbox(5_000, 64);

        let err = run(&sb, "   ", None).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::ValidationError);

        let err = run(&sb, "let = ;", None).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_oversized_context_rejected_before_execution() {
        let sb = sandbox(5_000, 1);
        let big = "x".repeat(2 * 1024 * 1024);
        let err = run(&sb, "context", Some(json!({ "blob": big })))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let sb = sandbox(100, 64);
        let started = Instant::now();
        let err = run(&sb, "loop { }", None).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_memory_limit_enforced() {
        let sb = sandbox(10_000, 1);
        let err = run(&sb, r#"let s = "x"; loop { s += s; }"#, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::MemoryExceeded);
    }

    #[tokio::test]
    async fn test_runaway_recursion_is_bounded() {
        let sb = sandbox(10_000, 64);
        let err = run(&sb, "fn f(n) { f(n + 1) } f(0)", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::MemoryExceeded);
    }

    #[tokio::test]
    async fn test_no_state_shared_between_calls() {
        let sb = sandbox(5_000, 64);
        assert_eq!(run(&sb, "let leaked = 7; leaked", None).await.unwrap(), json!(7));
        let err = run(&sb, "leaked", None).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::RuntimeError);
    }

    #[tokio::test]
    async fn test_no_eval_or_imports() {
        let sb = sandbox(5_000, 64);
        assert!(run(&sb, r#"eval("40 + 2")"#, None).await.is_err());
        assert!(run(&sb, r#"import "std/fs" as fs; 1"#, None).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_stops_execution() {
        let sb = sandbox(30_000, 64);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = sb.execute("loop { }", None, token).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_instances_keep_their_own_bounds() {
        let strict = sandbox(50, 64);
        let relaxed = sandbox(5_000, 64);
        let code = "let n = 0; while n < 200000 { n += 1; } n";

        assert_eq!(
            run(&strict, "loop { }", None).await.unwrap_err().kind,
            SandboxErrorKind::Timeout
        );
        assert_eq!(run(&relaxed, code, None).await.unwrap(), json!(200000));
    }

    #[tokio::test]
    async fn test_code_failures_keep_instance_healthy() {
        let sb = sandbox(50, 1);
        let _ = run(&sb, "throw 1", None).await;
        let _ = run(&sb, "loop { }", None).await;
        assert!(sb.is_healthy());
        assert_eq!(run(&sb, "1 + 1", None).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_memory_limit_covers_all_live_values() {
        let sb = sandbox(20_000, 1);

        // Each frame holds its own string below the per-value ceiling
        let code = r#"
            fn f(n) {
                let t = "x";
                t.pad(900000, "y");
                t += n;
                if n == 0 { t.len() } else { f(n - 1) + t.len() }
            }
            f(40)
        "#;
        let err = run(&sb, code, None).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::MemoryExceeded);

        let err = run(
            &sb,
            r#"let a = "x"; a.pad(600000, "y"); let b = "x"; b.pad(600000, "z"); a.len() + b.len()"#,
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::MemoryExceeded);
        assert!(sb.is_healthy());

        let ok = run(&sb, r#"let a = "x"; a.pad(300000, "y"); a.len()"#, None)
            .await
            .unwrap();
        assert_eq!(ok, json!(300000));
    }

    #[tokio::test]
    async fn test_worker_crash_disables_instance() {
        let sb = ScriptSandbox::with_engine_setup(SandboxConfig::new(5_000, 64), |engine| {
            engine.register_fn("explode", || -> INT { panic!("native failure") });
        });

        let err = run(&sb, "explode()", None).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::Internal);
        assert!(!sb.is_healthy());

        let err = run(&sb, "1 + 1", None).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::Internal);
        assert!(err.message.contains("disabled"));
    }

    #[tokio::test]
    async fn test_stuck_worker_trips_watchdog() {
        let sb = ScriptSandbox::with_engine_setup(SandboxConfig::new(100, 64), |engine| {
            engine.register_fn("stall", || -> INT {
                std::thread::sleep(Duration::from_millis(2_500));
                0
            });
        });

        let started = Instant::now();
        let err = run(&sb, "stall()", None).await.unwrap_err();
        assert_eq!(err.kind, SandboxErrorKind::Internal);
        assert!(started.elapsed() < Duration::from_millis(2_450));
        assert!(!sb.is_healthy());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(ScriptSandbox::new(SandboxConfig::new(0, 64)).is_err());
    }
}
