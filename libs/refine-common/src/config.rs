// Solver configuration, read once at startup and passed explicitly
use crate::types::Language;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/solver.json";
pub const CONFIG_PATH_ENV: &str = "REFINE_CONFIG";

/// Fatal configuration problems, reported before any stage runs
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("model preference list is empty")]
    NoModels,

    #[error("missing API credentials: environment variable {0} is not set")]
    MissingCredentials(String),

    #[error("execution runtime not available: {0}")]
    RuntimeUnavailable(String),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Preferred model first, then fallbacks in order
    pub models: Vec<String>,
    pub api_base: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub call_timeout_secs: u64,
    pub max_requests_per_minute: u32,
    /// Extra attempts on the same model after a schema-invalid response
    pub schema_retries: u32,
    /// Sent with every model call through the gateway
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            models: vec!["gemini-2.0-flash".to_string(), "gemini-2.0-pro".to_string()],
            api_base: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            api_key_env: "REFINE_API_KEY".to_string(),
            call_timeout_secs: 90,
            max_requests_per_minute: 60,
            schema_retries: 2,
            temperature: 0.2,
            max_tokens: 8192,
        }
    }
}

impl ModelConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Resolve the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String, ConfigError> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ConfigError::MissingCredentials(self.api_key_env.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Number of full passes through the stage machine
    pub num_iterations: u32,
    pub max_possible_solutions: usize,
    pub remove_brute_force: bool,
    pub max_ai_tests: usize,
    pub append_public_tests_to_ai_tests: bool,
    pub validate_self_reflection: bool,
    pub validate_ai_tests: bool,
    pub max_code_generation_attempts: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            num_iterations: 1,
            max_possible_solutions: 3,
            remove_brute_force: true,
            max_ai_tests: 6,
            append_public_tests_to_ai_tests: true,
            validate_self_reflection: true,
            validate_ai_tests: true,
            max_code_generation_attempts: 8,
        }
    }
}

/// Budgets and toggles for one fix-loop stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixLoopSettings {
    pub max_allowed_calls: u32,
    pub max_fixes_per_test: u32,
    pub single_stage_fix: bool,
    pub use_test_explanations: bool,
    pub use_trace: bool,
    pub revert_on_regression: bool,
}

impl Default for FixLoopSettings {
    fn default() -> Self {
        Self {
            max_allowed_calls: 4,
            max_fixes_per_test: 3,
            single_stage_fix: true,
            use_test_explanations: true,
            use_trace: true,
            revert_on_regression: true,
        }
    }
}

/// How actual output is compared to expected output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonPolicy {
    pub order_sensitive: bool,
    /// Absolute delta under which numeric tokens compare equal
    pub numeric_tolerance: Option<f64>,
}

impl Default for ComparisonPolicy {
    fn default() -> Self {
        Self {
            order_sensitive: true,
            numeric_tolerance: Some(1e-4),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceLimits {
    pub enabled: bool,
    pub max_lines: usize,
    pub max_depth: usize,
}

impl Default for TraceLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            max_lines: 50,
            max_depth: 4,
        }
    }
}

/// Interpreter or compiler used to run candidate code.
///
/// `{file}` in `args` and `check_command` is replaced by `file_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub language: Language,
    pub command: String,
    pub args: Vec<String>,
    pub file_name: String,
    pub check_command: Option<Vec<String>>,
    pub image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::for_language(Language::Python)
    }
}

impl RuntimeConfig {
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Python => Self {
                language,
                command: "python3".to_string(),
                args: vec!["-u".to_string(), "{file}".to_string()],
                file_name: "main.py".to_string(),
                check_command: Some(vec![
                    "python3".to_string(),
                    "-m".to_string(),
                    "py_compile".to_string(),
                    "{file}".to_string(),
                ]),
                image: "python:3.12-slim".to_string(),
                memory_limit_mb: 256,
                cpu_limit: 0.5,
            },
            Language::Shell => Self {
                language,
                command: "sh".to_string(),
                args: vec!["{file}".to_string()],
                file_name: "main.sh".to_string(),
                check_command: Some(vec!["sh".to_string(), "-n".to_string(), "{file}".to_string()]),
                image: "busybox:latest".to_string(),
                memory_limit_mb: 64,
                cpu_limit: 0.5,
            },
        }
    }

    /// Full argv for running the candidate
    pub fn run_argv(&self) -> Vec<String> {
        let mut argv = vec![self.command.clone()];
        argv.extend(self.args.iter().map(|a| a.replace("{file}", &self.file_name)));
        argv
    }

    /// Full argv for the syntax pre-check, if the runtime has one
    pub fn check_argv(&self) -> Option<Vec<String>> {
        self.check_command.as_ref().map(|cmd| {
            cmd.iter()
                .map(|a| a.replace("{file}", &self.file_name))
                .collect()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Run candidates in Docker containers instead of local processes
    pub sandbox: bool,
    pub test_timeout_ms: u64,
    pub max_parallel_tests: usize,
    pub comparison: ComparisonPolicy,
    pub trace: TraceLimits,
    pub runtime: RuntimeConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            sandbox: false,
            test_timeout_ms: 3000,
            max_parallel_tests: 4,
            comparison: ComparisonPolicy::default(),
            trace: TraceLimits::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub model: ModelConfig,
    pub pipeline: PipelineSettings,
    pub public_tests: FixLoopSettings,
    pub ai_tests: FixLoopSettings,
    pub executor: ExecutorConfig,
}

impl SolverConfig {
    /// Load configuration from a JSON file and validate it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: SolverConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `$REFINE_CONFIG`, falling back to config/solver.json
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    /// Check the knobs that do not depend on the environment
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.models.iter().all(|m| m.trim().is_empty()) {
            return Err(ConfigError::NoModels);
        }
        if self.model.max_requests_per_minute == 0 {
            return Err(ConfigError::Invalid {
                field: "model.max_requests_per_minute",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.model.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "model.call_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.num_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.num_iterations",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.max_code_generation_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.max_code_generation_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.executor.test_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "executor.test_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.executor.max_parallel_tests == 0 {
            return Err(ConfigError::Invalid {
                field: "executor.max_parallel_tests",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(delta) = self.executor.comparison.numeric_tolerance {
            if !delta.is_finite() || delta < 0.0 {
                return Err(ConfigError::Invalid {
                    field: "executor.comparison.numeric_tolerance",
                    reason: format!("must be a non-negative number, got {}", delta),
                });
            }
        }
        if self.executor.runtime.command.trim().is_empty() {
            return Err(ConfigError::RuntimeUnavailable("runtime command is empty".to_string()));
        }
        Ok(())
    }
}
