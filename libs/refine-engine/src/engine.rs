/// Execution Engine - Abstraction for Running Candidate Programs
///
/// **Core Responsibility:**
/// Run one program in a fresh, isolated workspace and capture raw outputs.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (local process, Docker container)
/// - Engine does NOT know comparison rules
/// - Engine does NOT evaluate correctness
/// - Engine returns raw outputs for the Evaluator to judge
///
/// Every `run` gets its own workspace; nothing is shared between test cases
/// or between candidate versions.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use refine_common::config::{ConfigError, RuntimeConfig};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Safety limits to prevent pathological inputs from reaching a runtime
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB
pub const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// How long to wait for pipe readers after the process is gone
const READER_GRACE: Duration = Duration::from_millis(500);

/// One isolated program run
#[derive(Debug, Clone)]
pub struct ProgramRun {
    /// Files written into the fresh workspace, as (file name, contents)
    pub files: Vec<(String, String)>,
    pub argv: Vec<String>,
    pub stdin: String,
    pub timeout: Duration,
}

/// Raw execution output for a single run.
/// Produced by an ExecutionEngine, consumed by the Evaluator.
#[derive(Debug, Clone, Default)]
pub struct RawExecution {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub runtime_error: bool,
}

impl RawExecution {
    /// Output for a run that never reached the runtime
    pub fn sandbox_error(message: impl Into<String>) -> Self {
        Self {
            stderr: message.into(),
            runtime_error: true,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run a program to completion or until its timeout.
    ///
    /// A timeout or a crash is a successful `Ok` with the matching flag set;
    /// `Err` means the engine itself failed.
    async fn run(&self, program: &ProgramRun) -> Result<RawExecution>;
}

/// Runs candidates as local child processes in a throwaway directory.
///
/// Each run gets a fresh temp dir, a cleared environment and
/// kill-on-drop, so a hung program is terminated when its timeout fires.
#[derive(Debug, Clone, Default)]
pub struct LocalEngine;

impl LocalEngine {
    pub fn new() -> Self {
        Self
    }

    /// Fail at startup when the runtime binary cannot be found
    pub fn ensure_runtime(runtime: &RuntimeConfig) -> Result<(), ConfigError> {
        if find_executable(&runtime.command).is_some() {
            Ok(())
        } else {
            Err(ConfigError::RuntimeUnavailable(format!(
                "'{}' not found on PATH",
                runtime.command
            )))
        }
    }
}

fn find_executable(command: &str) -> Option<std::path::PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|p| p.is_file())
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let mut limited = reader.take(limit as u64);
    if let Err(e) = limited.read_to_end(&mut buf).await {
        debug!(error = %e, "Output pipe closed early");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Collect a reader task, giving up if a leftover child still holds the pipe
async fn collect(mut handle: JoinHandle<String>) -> String {
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

#[cfg(unix)]
fn signal_note(status: &std::process::ExitStatus) -> Option<&'static str> {
    use std::os::unix::process::ExitStatusExt;
    match status.signal()? {
        9 => Some("[Process killed: likely exceeded memory limit]"),
        11 => Some("[Process killed: segmentation fault]"),
        6 => Some("[Process aborted]"),
        _ => Some("[Process terminated by signal]"),
    }
}

#[cfg(not(unix))]
fn signal_note(_status: &std::process::ExitStatus) -> Option<&'static str> {
    None
}

#[async_trait]
impl ExecutionEngine for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(&self, program: &ProgramRun) -> Result<RawExecution> {
        if program.argv.is_empty() {
            bail!("Empty command line");
        }

        let workspace = tempfile::Builder::new()
            .prefix("refine-run-")
            .tempdir()
            .context("Failed to create run workspace")?;

        for (name, contents) in &program.files {
            tokio::fs::write(workspace.path().join(name), contents)
                .await
                .with_context(|| format!("Failed to write {}", name))?;
        }

        let mut cmd = Command::new(&program.argv[0]);
        cmd.args(&program.argv[1..])
            .current_dir(workspace.path())
            .env_clear()
            .env("HOME", workspace.path())
            .env("LANG", "C.UTF-8")
            .env("PYTHONHASHSEED", "0")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        let start_time = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to launch '{}'", program.argv[0]))?;

        let stdin = child.stdin.take();
        let input = program.stdin.clone();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // The program may exit without reading its input
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
        });
        let stdout_reader = tokio::spawn(read_capped(child.stdout.take(), MAX_OUTPUT_BYTES));
        let stderr_reader = tokio::spawn(read_capped(child.stderr.take(), MAX_OUTPUT_BYTES));

        let mut timed_out = false;
        let mut runtime_error = false;
        let mut note = None;
        let mut exit_code = None;

        match tokio::time::timeout(program.timeout, child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed waiting for process")?;
                exit_code = status.code().map(i64::from);
                if !status.success() {
                    runtime_error = true;
                    note = signal_note(&status);
                }
            }
            Err(_) => {
                timed_out = true;
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out process");
                }
            }
        }

        let execution_time_ms = start_time.elapsed().as_millis() as u64;
        writer.abort();
        let stdout = collect(stdout_reader).await;
        let mut stderr = collect(stderr_reader).await;

        if let Some(note) = note {
            stderr.push('\n');
            stderr.push_str(note);
        }
        if timed_out {
            stderr.push_str("\n[Execution timed out]");
        }

        Ok(RawExecution {
            stdout,
            stderr,
            exit_code,
            execution_time_ms,
            timed_out,
            runtime_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(code: &str, stdin: &str, timeout_ms: u64) -> ProgramRun {
        ProgramRun {
            files: vec![("main.sh".to_string(), code.to_string())],
            argv: vec!["sh".to_string(), "main.sh".to_string()],
            stdin: stdin.to_string(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_echo_input() {
        let out = LocalEngine::new()
            .run(&shell("read n\necho $((n * 2))\n", "21\n", 5000))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "42");
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.runtime_error);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_runtime_error_with_stderr() {
        let out = LocalEngine::new()
            .run(&shell("echo boom >&2\nexit 3\n", "", 5000))
            .await
            .unwrap();
        assert!(out.runtime_error);
        assert_eq!(out.exit_code, Some(3));
        assert!(out.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn test_busy_loop_times_out() {
        let out = LocalEngine::new()
            .run(&shell("while :; do :; done\n", "", 300))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.runtime_error);
        assert!(out.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_runs_do_not_share_workspace() {
        let engine = LocalEngine::new();
        let first = engine
            .run(&shell("echo leftover > state.txt\necho done\n", "", 5000))
            .await
            .unwrap();
        assert_eq!(first.stdout.trim(), "done");

        let second = engine
            .run(&shell("if [ -f state.txt ]; then echo seen; else echo clean; fi\n", "", 5000))
            .await
            .unwrap();
        assert_eq!(second.stdout.trim(), "clean");
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("REFINE_ENGINE_SECRET", "hunter2");
        let out = LocalEngine::new()
            .run(&shell("echo \"[$REFINE_ENGINE_SECRET]\"\n", "", 5000))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "[]");
    }

    #[tokio::test]
    async fn test_missing_binary_is_engine_error() {
        let program = ProgramRun {
            files: vec![],
            argv: vec!["refine-no-such-binary".to_string()],
            stdin: String::new(),
            timeout: Duration::from_secs(1),
        };
        assert!(LocalEngine::new().run(&program).await.is_err());
    }

    #[test]
    fn test_ensure_runtime() {
        let mut runtime = RuntimeConfig::for_language(refine_common::types::Language::Shell);
        assert!(LocalEngine::ensure_runtime(&runtime).is_ok());

        runtime.command = "refine-no-such-binary".to_string();
        assert!(matches!(
            LocalEngine::ensure_runtime(&runtime),
            Err(ConfigError::RuntimeUnavailable(_))
        ));
    }
}
