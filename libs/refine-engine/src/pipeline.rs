//! Stage pipeline controller.
//!
//! One outer iteration walks the stages strictly forward:
//!
//! ```text
//! SelfReflection → PossibleSolutions → ChooseApproach → GenerateAiTests
//!   → InitialCodeGeneration → PublicTestFixLoop → AiTestFixLoop → Done
//! ```
//!
//! A stage that cannot produce its output ends the iteration. The next
//! iteration resumes at PossibleSolutions (or SelfReflection if no
//! reflection exists yet) with the previously selected approach abandoned.
//! Reflection, the approach pool and AI tests carry over between
//! iterations; attempt counters never reset.

use crate::artifact::{Budget, SolutionArtifact, Snapshot};
use crate::backend::ChatCompletionsBackend;
use crate::executor::TestExecutor;
use crate::fix_loop::{FixLoop, RepairContext};
use crate::gateway::ModelGateway;
use crate::prompts;
use crate::responses::{clean_code, AiTests, GeneratedCode, PossibleSolutions, SelfReflection};
use refine_common::config::{ConfigError, FixLoopSettings, SolverConfig};
use refine_common::types::{
    failing_count, CandidateApproach, Language, Problem, SolveOutcome, Stage, TestCase,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A stage that could not produce its output
#[derive(Debug, Clone, thiserror::Error)]
#[error("stage {stage} failed: {reason}")]
pub struct StageFailure {
    pub stage: Stage,
    pub reason: String,
}

impl StageFailure {
    fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

pub type StageOutcome = Result<(), StageFailure>;

/// Per-problem state owned by the controller
struct Run<'a> {
    problem: &'a Problem,
    artifact: SolutionArtifact,
    reflection: Option<String>,
    /// Public tests with explanations from the reflection filled in
    public_tests: Vec<TestCase>,
    remaining: Vec<CandidateApproach>,
    abandoned: Vec<CandidateApproach>,
    selected: Option<CandidateApproach>,
    ai_tests: Option<Vec<TestCase>>,
    best: Option<(Snapshot, Vec<TestCase>)>,
    /// Code-generation attempts for the whole solve, never reset on restart
    codegen: Budget,
}

impl<'a> Run<'a> {
    fn new(problem: &'a Problem, codegen_attempts: u32) -> Self {
        Self {
            problem,
            artifact: SolutionArtifact::new(),
            reflection: None,
            public_tests: problem.public_tests.clone(),
            remaining: Vec::new(),
            abandoned: Vec::new(),
            selected: None,
            ai_tests: None,
            best: None,
            codegen: Budget::new(codegen_attempts),
        }
    }

    fn context(&self, language: Language) -> RepairContext<'_> {
        RepairContext {
            problem: self.problem,
            reflection: self.reflection.as_deref(),
            approach: self.selected.as_ref(),
            language,
        }
    }

    /// Public tests followed by AI tests, without repeating an input
    fn verification_tests(&self) -> Vec<TestCase> {
        let mut tests = self.public_tests.clone();
        for test in self.ai_tests.iter().flatten() {
            if !tests.iter().any(|t| t.input.trim() == test.input.trim()) {
                tests.push(test.clone());
            }
        }
        tests
    }
}

pub struct Solver {
    config: SolverConfig,
    models: Vec<String>,
    gateway: ModelGateway,
    executor: TestExecutor,
}

impl Solver {
    /// Build the backend, gateway and executor from config.
    ///
    /// Every fatal configuration problem (no models, missing credentials,
    /// missing runtime, unreachable Docker daemon) is reported here, before
    /// any stage runs.
    pub async fn new(config: SolverConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let backend = ChatCompletionsBackend::from_config(&config.model)?;
        let gateway = ModelGateway::from_config(Arc::new(backend), &config.model);
        let executor = TestExecutor::from_config(&config.executor).await?;
        Ok(Self::with_parts(config, gateway, executor))
    }

    /// Assemble from prebuilt parts, e.g. to share one rate limiter
    pub fn with_parts(config: SolverConfig, gateway: ModelGateway, executor: TestExecutor) -> Self {
        let models = config
            .model
            .models
            .iter()
            .filter(|m| !m.trim().is_empty())
            .cloned()
            .collect();
        Self {
            config,
            models,
            gateway,
            executor,
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    fn language(&self) -> Language {
        self.config.executor.runtime.language
    }

    #[instrument(skip_all, fields(problem = %problem.name))]
    pub async fn solve(&self, problem: &Problem) -> SolveOutcome {
        let mut run = Run::new(problem, self.config.pipeline.max_code_generation_attempts);
        let mut iterations_used = 0;
        let mut solved = false;

        for iteration in 1..=self.config.pipeline.num_iterations {
            iterations_used = iteration;
            if iteration > 1 {
                let start = if run.reflection.is_some() {
                    Stage::PossibleSolutions
                } else {
                    Stage::SelfReflection
                };
                run.artifact.restart_at(start);
            }
            info!(iteration, "Starting iteration");

            match self.run_iteration(&mut run).await {
                Ok(true) => {
                    solved = true;
                    break;
                }
                Ok(false) => info!(iteration, "Iteration ended with failing tests"),
                Err(failure) => warn!(iteration, error = %failure, "Iteration aborted"),
            }

            if let Some(approach) = run.selected.take() {
                debug!(approach = %approach.name, "Abandoning approach");
                run.abandoned.push(approach);
            }
        }

        let (final_code, tests, verdicts) = match run.best {
            Some((snapshot, tests)) => (snapshot.code, tests, snapshot.verdicts),
            None => (String::new(), Vec::new(), Vec::new()),
        };
        info!(
            solved,
            iterations_used,
            failing = failing_count(&verdicts),
            attempts = run.artifact.generation_attempts(),
            "Pipeline finished"
        );

        SolveOutcome {
            problem_name: problem.name.clone(),
            final_code,
            tests,
            verdicts,
            solved,
            iterations_used,
            generation_attempts: run.artifact.generation_attempts(),
            stage_usage: run.artifact.usage().clone(),
        }
    }

    /// One pass through the stage machine; `Ok(true)` when every
    /// verification test passes.
    async fn run_iteration(&self, run: &mut Run<'_>) -> Result<bool, StageFailure> {
        if run.reflection.is_none() {
            self.self_reflection(run).await?;
            run.artifact.advance(Stage::PossibleSolutions);
        }
        self.possible_solutions(run).await?;

        run.artifact.advance(Stage::ChooseApproach);
        self.choose_approach(run)?;

        run.artifact.advance(Stage::GenerateAiTests);
        self.generate_ai_tests(run).await?;

        run.artifact.advance(Stage::InitialCodeGeneration);
        self.initial_code_generation(run).await?;

        run.artifact.advance(Stage::PublicTestFixLoop);
        let public = run.public_tests.clone();
        self.fix_tests(run, Stage::PublicTestFixLoop, &public, &self.config.public_tests)
            .await;

        run.artifact.advance(Stage::AiTestFixLoop);
        let ai = run.ai_tests.clone().unwrap_or_default();
        self.fix_tests(run, Stage::AiTestFixLoop, &ai, &self.config.ai_tests)
            .await;

        run.artifact.advance(Stage::Done);
        Ok(self.verify(run).await)
    }

    async fn self_reflection(&self, run: &mut Run<'_>) -> StageOutcome {
        let stage = Stage::SelfReflection;
        let validate = self.config.pipeline.validate_self_reflection;
        let mut attempts = Budget::new(if validate { 2 } else { 1 });
        let prompt = prompts::self_reflection(run.problem, self.language());
        let mut last_error = String::new();

        while attempts.try_consume() {
            run.artifact.charge_call(stage);
            let reflection = match self.gateway.invoke::<SelfReflection>(&prompt, &self.models).await {
                Ok(reflection) => reflection,
                Err(e) => {
                    warn!(error = %e, "Self-reflection call failed");
                    last_error = e.to_string();
                    continue;
                }
            };
            if validate {
                if let Err(reason) = reflection.check_against(&run.problem.public_tests) {
                    warn!(reason = %reason, "Self-reflection failed validation");
                    last_error = reason;
                    continue;
                }
            }

            run.public_tests = annotate_tests(&run.problem.public_tests, &reflection);
            run.reflection = Some(reflection.self_reflection);
            info!("Self-reflection done");
            return Ok(());
        }
        Err(StageFailure::new(stage, last_error))
    }

    async fn possible_solutions(&self, run: &mut Run<'_>) -> StageOutcome {
        let stage = Stage::PossibleSolutions;
        if !run.remaining.is_empty() {
            debug!(remaining = run.remaining.len(), "Reusing remaining approaches");
            return Ok(());
        }

        let settings = &self.config.pipeline;
        let prompt = prompts::possible_solutions(
            run.problem,
            run.reflection.as_deref(),
            settings.max_possible_solutions,
            &run.abandoned,
            self.language(),
        );
        run.artifact.charge_call(stage);
        let response = self
            .gateway
            .invoke::<PossibleSolutions>(&prompt, &self.models)
            .await
            .map_err(|e| StageFailure::new(stage, e.to_string()))?;

        let mut approaches = response.into_approaches();
        approaches.truncate(settings.max_possible_solutions);
        approaches.retain(|a| {
            !run
                .abandoned
                .iter()
                .any(|b| b.content.trim() == a.content.trim())
        });
        if settings.remove_brute_force {
            approaches.retain(|a| !a.is_brute_force);
        }
        if approaches.is_empty() {
            return Err(StageFailure::new(stage, "no usable approaches"));
        }

        info!(count = approaches.len(), "Possible solutions generated");
        run.remaining = approaches;
        Ok(())
    }

    fn choose_approach(&self, run: &mut Run<'_>) -> StageOutcome {
        let approach = take_best_approach(&mut run.remaining)
            .ok_or_else(|| StageFailure::new(Stage::ChooseApproach, "no approaches remaining"))?;
        info!(approach = %approach.name, score = approach.score, "Approach chosen");
        run.selected = Some(approach);
        Ok(())
    }

    async fn generate_ai_tests(&self, run: &mut Run<'_>) -> StageOutcome {
        let stage = Stage::GenerateAiTests;
        if run.ai_tests.is_some() {
            debug!("Reusing AI tests from an earlier iteration");
            return Ok(());
        }

        let settings = &self.config.pipeline;
        let prompt = prompts::ai_tests(
            run.problem,
            run.reflection.as_deref(),
            settings.max_ai_tests,
            self.language(),
        );
        run.artifact.charge_call(stage);
        let response = self
            .gateway
            .invoke::<AiTests>(&prompt, &self.models)
            .await
            .map_err(|e| StageFailure::new(stage, e.to_string()))?;

        let mut tests = response.into_test_cases();
        tests.truncate(settings.max_ai_tests);
        if settings.validate_ai_tests {
            let generated = tests.len();
            tests = sanitize_ai_tests(tests, &run.public_tests);
            if tests.len() < generated {
                info!(dropped = generated - tests.len(), "Dropped invalid AI tests");
            }
        }
        if settings.append_public_tests_to_ai_tests {
            tests.extend(run.public_tests.iter().cloned());
        }

        info!(count = tests.len(), "AI tests ready");
        run.ai_tests = Some(tests);
        Ok(())
    }

    async fn initial_code_generation(&self, run: &mut Run<'_>) -> StageOutcome {
        let stage = Stage::InitialCodeGeneration;
        let Some(approach) = run.selected.clone() else {
            return Err(StageFailure::new(stage, "no approach selected"));
        };

        if run.codegen.is_exhausted() {
            return Err(StageFailure::new(
                stage,
                format!("code generation budget spent ({} attempts)", run.codegen.used()),
            ));
        }

        let mut previous_failure: Option<String> = None;
        let mut tried = 0u32;

        while run.codegen.try_consume() {
            tried += 1;
            run.artifact.record_generation_attempt();
            run.artifact.charge_call(stage);
            let prompt = prompts::initial_code(
                run.problem,
                run.reflection.as_deref(),
                &approach,
                previous_failure.as_deref(),
                self.language(),
            );

            let generated = match self.gateway.invoke::<GeneratedCode>(&prompt, &self.models).await {
                Ok(generated) => generated,
                Err(e) => {
                    warn!(
                        attempt = tried,
                        left = run.codegen.remaining(),
                        error = %e,
                        "Code generation call failed"
                    );
                    continue;
                }
            };

            let code = clean_code(&generated.code);
            match self.executor.check_syntax(&code).await {
                Ok(()) => {
                    info!(attempt = tried, left = run.codegen.remaining(), "Initial code generated");
                    run.artifact.replace_code(code);
                    return Ok(());
                }
                Err(diagnostic) => {
                    warn!(attempt = tried, left = run.codegen.remaining(), "Generated code does not run");
                    previous_failure = Some(diagnostic);
                }
            }
        }

        Err(StageFailure::new(
            stage,
            format!("no runnable code after {} attempts", tried),
        ))
    }

    async fn fix_tests(
        &self,
        run: &mut Run<'_>,
        stage: Stage,
        tests: &[TestCase],
        settings: &FixLoopSettings,
    ) {
        if tests.is_empty() {
            debug!(stage = %stage, "No tests, skipping fix loop");
            return;
        }

        let fix_loop = FixLoop {
            gateway: &self.gateway,
            executor: &self.executor,
            models: &self.models,
            policy: &self.config.executor.comparison,
            settings,
            stage,
        };
        let outcome = fix_loop
            .repair(run.context(self.language()), &run.artifact, tests)
            .await;
        run.artifact = outcome.artifact;
    }

    /// Final run over public and AI tests; records the best version seen
    async fn verify(&self, run: &mut Run<'_>) -> bool {
        let tests = run.verification_tests();
        let verdicts = self
            .executor
            .run(run.artifact.code(), &tests, &self.config.executor.comparison)
            .await;
        run.artifact.record_verdicts(verdicts.clone());

        let snapshot = Snapshot::new(run.artifact.code(), &verdicts);
        let solved = !tests.is_empty() && snapshot.failing() == 0;
        info!(tests = tests.len(), failing = snapshot.failing(), solved, "Verification finished");

        let improved = run
            .best
            .as_ref()
            .map_or(true, |(best, _)| snapshot.beats(best));
        if improved {
            run.best = Some((snapshot, tests));
        }
        solved
    }
}

/// Highest score wins; ties go to the earliest
fn take_best_approach(candidates: &mut Vec<CandidateApproach>) -> Option<CandidateApproach> {
    let mut best: Option<usize> = None;
    for (i, approach) in candidates.iter().enumerate() {
        if best.map_or(true, |b| approach.score > candidates[b].score) {
            best = Some(i);
        }
    }
    best.map(|i| candidates.remove(i))
}

/// Attach reflection explanations to public tests that have none.
/// Explanations are matched by input text, then by position.
fn annotate_tests(public_tests: &[TestCase], reflection: &SelfReflection) -> Vec<TestCase> {
    public_tests
        .iter()
        .enumerate()
        .map(|(i, test)| {
            if test.explanation.is_some() {
                return test.clone();
            }
            let explanation = reflection
                .tests_explanations
                .iter()
                .find(|e| e.input.trim() == test.input.trim())
                .or_else(|| reflection.tests_explanations.get(i))
                .map(|e| e.explanation.trim().to_string())
                .filter(|e| !e.is_empty());
            TestCase {
                explanation,
                ..test.clone()
            }
        })
        .collect()
}

/// Drop generated tests that are empty, repeat an earlier input, or reuse a
/// public test's input.
fn sanitize_ai_tests(generated: Vec<TestCase>, public_tests: &[TestCase]) -> Vec<TestCase> {
    let mut kept: Vec<TestCase> = Vec::with_capacity(generated.len());
    for test in generated {
        let input = test.input.trim();
        if test.expected_output.trim().is_empty() {
            debug!(input = %input, "Dropping AI test with empty expected output");
            continue;
        }
        if public_tests.iter().any(|p| p.input.trim() == input) {
            debug!(input = %input, "Dropping AI test that duplicates a public input");
            continue;
        }
        if kept.iter().any(|k| k.input.trim() == input) {
            debug!(input = %input, "Dropping duplicate AI test");
            continue;
        }
        kept.push(test);
    }
    kept
}

/// Build a solver from `config` and solve one problem
pub async fn solve(problem: &Problem, config: SolverConfig) -> Result<SolveOutcome, ConfigError> {
    let solver = Solver::new(config).await?;
    Ok(solver.solve(problem).await)
}
