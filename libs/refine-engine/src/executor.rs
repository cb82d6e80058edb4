/// Test Executor - Runs a candidate against a batch of test cases
///
/// **Flow:**
/// 1. Guard input sizes
/// 2. Run every test in its own fresh workspace (bounded parallelism)
/// 3. Evaluate each raw output into a verdict
/// 4. For failures, optionally re-run under the tracer and attach the trace
///
/// Exactly one verdict per test, in input order. Tracing never changes a
/// verdict.

use crate::docker::DockerEngine;
use crate::engine::{
    ExecutionEngine, LocalEngine, ProgramRun, RawExecution, MAX_SOURCE_CODE_BYTES,
    MAX_TEST_INPUT_BYTES,
};
use crate::evaluator::evaluate_test;
use crate::trace::{split_trace, traced_argv, HARNESS_FILE, PYTHON_HARNESS};
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use refine_common::config::{
    ComparisonPolicy, ConfigError, ExecutorConfig, RuntimeConfig, TraceLimits,
};
use refine_common::types::{failing_count, TestCase, TestVerdict};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct TestExecutor {
    engine: Arc<dyn ExecutionEngine>,
    runtime: RuntimeConfig,
    timeout: Duration,
    max_parallel: usize,
    trace: TraceLimits,
}

impl TestExecutor {
    pub fn new(engine: Arc<dyn ExecutionEngine>, config: &ExecutorConfig) -> Self {
        Self {
            engine,
            runtime: config.runtime.clone(),
            timeout: config.test_timeout(),
            max_parallel: config.max_parallel_tests.max(1),
            trace: config.trace,
        }
    }

    /// Pick the engine from config and check the runtime is usable
    pub async fn from_config(config: &ExecutorConfig) -> Result<Self, ConfigError> {
        let engine: Arc<dyn ExecutionEngine> = if config.sandbox {
            Arc::new(DockerEngine::connect(&config.runtime).await?)
        } else {
            LocalEngine::ensure_runtime(&config.runtime)?;
            Arc::new(LocalEngine::new())
        };
        info!(engine = engine.name(), language = %config.runtime.language, "Execution engine ready");
        Ok(Self::new(engine, config))
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Run `code` against every test and return one verdict per test
    #[instrument(skip(self, code, tests, policy), fields(tests = tests.len()))]
    pub async fn run(
        &self,
        code: &str,
        tests: &[TestCase],
        policy: &ComparisonPolicy,
    ) -> Vec<TestVerdict> {
        let verdicts: Vec<TestVerdict> = stream::iter(tests.iter().enumerate())
            .map(|(index, test)| self.run_one(code, index, test, policy))
            .buffered(self.max_parallel)
            .collect::<Vec<_>>()
            .boxed()
            .await;

        debug!(failing = failing_count(&verdicts), "Test batch finished");
        verdicts
    }

    async fn run_one(
        &self,
        code: &str,
        index: usize,
        test: &TestCase,
        policy: &ComparisonPolicy,
    ) -> TestVerdict {
        let raw = match self.guard(code, &test.input) {
            Err(message) => RawExecution::sandbox_error(message),
            Ok(()) => self.execute(self.program(code, &test.input)).await,
        };

        let mut verdict = evaluate_test(index, &raw, test, policy);
        if !verdict.passed() && self.trace.enabled {
            verdict.trace = self.capture_trace(code, &test.input).await;
        }
        verdict
    }

    fn guard(&self, code: &str, input: &str) -> Result<(), String> {
        if code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(format!(
                "Source code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            ));
        }
        if input.len() > MAX_TEST_INPUT_BYTES {
            return Err(format!(
                "Test input exceeds maximum size of {} bytes",
                MAX_TEST_INPUT_BYTES
            ));
        }
        Ok(())
    }

    fn program(&self, code: &str, stdin: &str) -> ProgramRun {
        ProgramRun {
            files: vec![(self.runtime.file_name.clone(), code.to_string())],
            argv: self.runtime.run_argv(),
            stdin: stdin.to_string(),
            timeout: self.timeout,
        }
    }

    async fn execute(&self, program: ProgramRun) -> RawExecution {
        match self.engine.run(&program).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(engine = self.engine.name(), error = %format!("{:#}", e), "Execution engine error");
                RawExecution::sandbox_error(format!("Sandbox error: {:#}", e))
            }
        }
    }

    /// Re-run a failing test under the tracer in a fresh workspace
    async fn capture_trace(&self, code: &str, input: &str) -> Option<String> {
        let argv = traced_argv(&self.runtime, &self.trace)?;
        let mut program = self.program(code, input);
        program.files.push((HARNESS_FILE.to_string(), PYTHON_HARNESS.to_string()));
        program.argv = argv;

        let raw = self.execute(program).await;
        let (_, trace) = split_trace(&raw.stderr, &self.trace);
        trace
    }

    /// Cheap pre-check that the program at least parses.
    ///
    /// `Err` carries the diagnostic output.
    pub async fn check_syntax(&self, code: &str) -> Result<(), String> {
        let Some(argv) = self.runtime.check_argv() else {
            return Ok(());
        };
        self.guard(code, "")?;

        let mut program = self.program(code, "");
        program.argv = argv;
        let raw = self.execute(program).await;

        if raw.timed_out {
            return Err("syntax check timed out".to_string());
        }
        if raw.runtime_error {
            let diagnostic = format!("{}\n{}", raw.stdout.trim(), raw.stderr.trim());
            return Err(diagnostic.trim().to_string());
        }
        Ok(())
    }
}
