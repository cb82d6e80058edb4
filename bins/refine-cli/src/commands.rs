// CLI commands for solving problems and talking to the worker queue
use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use refine_common::config::SolverConfig;
use refine_common::redis;
use refine_common::types::{failing_count, Problem, SolveJob, SolveOutcome};
use refine_engine::Solver;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries results, logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<SolverConfig> {
    let config = match path {
        Some(path) => SolverConfig::load(path),
        None => SolverConfig::load_default(),
    };
    config.context("Failed to load solver configuration")
}

/// Read a problem from JSON or YAML, picked by file extension
pub fn load_problem(path: &Path) -> Result<Problem> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read problem file {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let mut problem: Problem = if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?
    };

    if problem.description.trim().is_empty() {
        bail!("Problem in {} has no description", path.display());
    }
    if problem.name.trim().is_empty() {
        problem.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "problem".to_string());
    }
    Ok(problem)
}

fn safe_file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "solution".to_string()
    } else {
        stem
    }
}

/// Human-readable report of one outcome
pub fn format_summary(outcome: &SolveOutcome) -> String {
    let mut out = String::new();
    let mark = if outcome.solved { "✅" } else { "❌" };
    let state = if outcome.solved { "solved" } else { "unsolved" };
    let _ = writeln!(
        out,
        "{} {}: {} after {} iteration(s), {} generation attempt(s)",
        mark, outcome.problem_name, state, outcome.iterations_used, outcome.generation_attempts
    );

    let total = outcome.verdicts.len();
    let _ = writeln!(
        out,
        "   tests: {}/{} passed",
        total - failing_count(&outcome.verdicts),
        total
    );
    for verdict in outcome.verdicts.iter().filter(|v| !v.passed()) {
        let _ = writeln!(out, "   test {} failed: {:?}", verdict.test_index + 1, verdict.status);
    }
    for (stage, usage) in &outcome.stage_usage {
        let _ = writeln!(
            out,
            "   {}: {} call(s), {} fix(es)",
            stage, usage.calls, usage.fixes
        );
    }
    out
}

pub async fn solve(
    files: &[PathBuf],
    config_path: Option<&Path>,
    out_dir: Option<&Path>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let extension = Path::new(&config.executor.runtime.file_name)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "txt".to_string());

    let problems = files
        .iter()
        .map(|f| load_problem(f))
        .collect::<Result<Vec<_>>>()?;

    // One solver, so every problem shares the rate limiter
    let solver = Solver::new(config).await?;
    info!(problems = problems.len(), "Solving");
    let outcomes = join_all(problems.iter().map(|p| solver.solve(p))).await;

    if let Some(dir) = out_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        for outcome in outcomes.iter().filter(|o| !o.final_code.is_empty()) {
            let path = dir.join(format!("{}.{}", safe_file_stem(&outcome.problem_name), extension));
            fs::write(&path, &outcome.final_code)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Wrote final code");
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for outcome in &outcomes {
            print!("{}", format_summary(outcome));
        }
    }

    let unsolved = outcomes.iter().filter(|o| !o.solved).count();
    if unsolved > 0 {
        bail!("{} of {} problem(s) unsolved", unsolved, outcomes.len());
    }
    Ok(())
}

async fn connect_redis() -> Result<::redis::aio::ConnectionManager> {
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = ::redis::Client::open(redis_url.as_str())
        .with_context(|| format!("Invalid REDIS_URL {}", redis_url))?;
    ::redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

pub async fn submit(file: &Path) -> Result<()> {
    let problem = load_problem(file)?;
    let job = SolveJob::new(problem);
    let mut conn = connect_redis().await?;
    redis::push_job(&mut conn, &job)
        .await
        .context("Failed to queue job")?;

    info!(job_id = %job.id, problem = %job.problem.name, "Job queued");
    println!("{}", job.id);
    Ok(())
}

pub async fn fetch_result(id: &str, json: bool) -> Result<()> {
    let job_id = uuid::Uuid::parse_str(id).with_context(|| format!("Invalid job id {}", id))?;
    let mut conn = connect_redis().await?;
    let Some(result) = redis::get_result(&mut conn, &job_id)
        .await
        .context("Failed to fetch result")?
    else {
        bail!("No result for job {} (still running, unknown or expired)", job_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", format_summary(&result.outcome));
        println!("   completed at: {}", result.completed_at);
        if !result.outcome.final_code.is_empty() {
            println!("\n{}", result.outcome.final_code.trim_end());
        }
    }
    Ok(())
}

pub async fn check_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let models = config.model.models.join(", ");
    let language = config.executor.runtime.language;
    let sandbox = config.executor.sandbox;

    Solver::new(config)
        .await
        .context("Startup checks failed")?;

    println!("✅ Configuration OK");
    println!("   models: {}", models);
    println!("   language: {}", language);
    println!("   sandbox: {}", if sandbox { "docker" } else { "local" });
    Ok(())
}
