//! Fix-loop engine: test-driven repair of a candidate program.
//!
//! ```text
//! run tests ──► all pass? ──yes──► done
//!     ▲             │ no
//!     │             ▼
//!     │      eligible failing tests? ──none──► give up (best-seen)
//!     │             │
//!     │             ▼
//!     │      call budget left? ──no──► give up (best-seen)
//!     │             │
//!     │             ▼
//!     └──new code── repair call ──error──► same verdicts, next round
//! ```
//!
//! A test stops being offered for repair after `max_fixes_per_test`
//! unsuccessful attempts. On give-up the loop returns the best version seen:
//! fewest failing tests, then lowest distance, then earliest.

use crate::artifact::{Budget, SolutionArtifact, Snapshot};
use crate::executor::TestExecutor;
use crate::gateway::ModelGateway;
use crate::prompts::{self, FixRequest};
use crate::responses::{clean_code, CodeFix};
use refine_common::config::{ComparisonPolicy, FixLoopSettings};
use refine_common::types::{
    failing_count, CandidateApproach, Language, Problem, Stage, TestCase,
};
use tracing::{debug, info, instrument, warn};

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixExit {
    AllPassed,
    CallBudgetExhausted,
    NoEligibleTests,
}

#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub artifact: SolutionArtifact,
    pub exit: FixExit,
    pub calls_used: u32,
}

impl FixOutcome {
    pub fn passed(&self) -> bool {
        self.exit == FixExit::AllPassed
    }
}

/// Problem context shared by every repair prompt
#[derive(Clone, Copy)]
pub struct RepairContext<'a> {
    pub problem: &'a Problem,
    pub reflection: Option<&'a str>,
    pub approach: Option<&'a CandidateApproach>,
    pub language: Language,
}

pub struct FixLoop<'a> {
    pub gateway: &'a ModelGateway,
    pub executor: &'a TestExecutor,
    pub models: &'a [String],
    pub policy: &'a ComparisonPolicy,
    pub settings: &'a FixLoopSettings,
    /// Stage the loop's calls and fixes are charged to
    pub stage: Stage,
}

impl FixLoop<'_> {
    #[instrument(skip_all, fields(stage = %self.stage, tests = tests.len()))]
    pub async fn repair(
        &self,
        context: RepairContext<'_>,
        artifact: &SolutionArtifact,
        tests: &[TestCase],
    ) -> FixOutcome {
        let mut artifact = artifact.clone();
        let mut calls = Budget::new(self.settings.max_allowed_calls);
        let per_test_limit = if tests.len() == 1 {
            self.settings.max_fixes_per_test + 1
        } else {
            self.settings.max_fixes_per_test
        };
        let mut fix_attempts = vec![0u32; tests.len()];

        let mut verdicts = self
            .executor
            .run(artifact.code(), tests, self.policy)
            .await;
        artifact.record_verdicts(verdicts.clone());
        let mut best = Snapshot::new(artifact.code(), &verdicts);

        let exit = loop {
            if failing_count(&verdicts) == 0 {
                break FixExit::AllPassed;
            }

            let eligible: Vec<usize> = verdicts
                .iter()
                .filter(|v| !v.passed())
                .map(|v| v.test_index)
                .filter(|&i| fix_attempts[i] < per_test_limit)
                .collect();
            if eligible.is_empty() {
                break FixExit::NoEligibleTests;
            }
            if !calls.try_consume() {
                break FixExit::CallBudgetExhausted;
            }

            let targets: Vec<usize> = if self.settings.single_stage_fix {
                eligible
            } else {
                eligible.into_iter().take(1).collect()
            };
            for &i in &targets {
                fix_attempts[i] += 1;
            }

            artifact.charge_call(self.stage);
            let request = FixRequest {
                problem: context.problem,
                reflection: context.reflection,
                approach: context.approach,
                code: artifact.code(),
                tests,
                verdicts: &verdicts,
                targets: &targets,
                use_explanations: self.settings.use_test_explanations,
                use_trace: self.settings.use_trace,
                language: context.language,
            };
            let prompt = prompts::fix_code(&request);

            let fix = match self.gateway.invoke::<CodeFix>(&prompt, self.models).await {
                Ok(fix) => fix,
                Err(e) => {
                    warn!(error = %e, calls_used = calls.used(), "Repair call failed, keeping current code");
                    continue;
                }
            };

            debug!(diagnosis = %fix.what_went_wrong.trim(), "Applying repair");
            artifact.charge_fix(self.stage);
            artifact.replace_code(clean_code(&fix.fixed_code));
            verdicts = self
                .executor
                .run(artifact.code(), tests, self.policy)
                .await;
            artifact.record_verdicts(verdicts.clone());

            let current = Snapshot::new(artifact.code(), &verdicts);
            if current.beats(&best) {
                info!(failing = current.failing(), "Repair improved the candidate");
                best = current;
            } else if self.settings.revert_on_regression && best.regressions_in(&verdicts) > 0 {
                info!(
                    regressions = best.regressions_in(&verdicts),
                    "Repair broke passing tests, reverting to best version"
                );
                artifact.restore(best.code.clone(), best.verdicts.clone());
                verdicts = best.verdicts.clone();
            }
        };

        if exit != FixExit::AllPassed {
            artifact.restore(best.code.clone(), best.verdicts.clone());
        }

        info!(
            exit = ?exit,
            calls_used = calls.used(),
            failing = failing_count(artifact.verdicts()),
            "Fix loop finished"
        );

        FixOutcome {
            artifact,
            exit,
            calls_used: calls.used(),
        }
    }
}
