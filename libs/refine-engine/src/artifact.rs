//! The evolving solution and the counters that bound its refinement.

use refine_common::types::{failing_count, total_distance, Stage, StageUsage, TestVerdict};
use std::collections::BTreeMap;
use tracing::debug;

/// A bounded counter. Checked before it is spent, so `used` never
/// exceeds `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    limit: u32,
    used: u32,
}

impl Budget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Spend one unit if any remain
    #[must_use]
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.limit - self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// The current candidate program plus its ledger.
///
/// `verdicts` always describe `code`: replacing the code clears them until
/// the new code has been run.
#[derive(Debug, Clone)]
pub struct SolutionArtifact {
    code: String,
    stage: Stage,
    generation_attempts: u32,
    verdicts: Vec<TestVerdict>,
    usage: BTreeMap<Stage, StageUsage>,
}

impl Default for SolutionArtifact {
    fn default() -> Self {
        Self::new()
    }
}

impl SolutionArtifact {
    pub fn new() -> Self {
        Self {
            code: String::new(),
            stage: Stage::SelfReflection,
            generation_attempts: 0,
            verdicts: Vec::new(),
            usage: BTreeMap::new(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn verdicts(&self) -> &[TestVerdict] {
        &self.verdicts
    }

    pub fn generation_attempts(&self) -> u32 {
        self.generation_attempts
    }

    pub fn usage(&self) -> &BTreeMap<Stage, StageUsage> {
        &self.usage
    }

    /// Swap in new code; previous verdicts no longer apply
    pub fn replace_code(&mut self, code: String) {
        self.code = code;
        self.verdicts.clear();
    }

    pub fn record_verdicts(&mut self, verdicts: Vec<TestVerdict>) {
        self.verdicts = verdicts;
    }

    /// Restore an earlier code version together with the verdicts it earned
    pub fn restore(&mut self, code: String, verdicts: Vec<TestVerdict>) {
        self.code = code;
        self.verdicts = verdicts;
    }

    pub fn record_generation_attempt(&mut self) {
        self.generation_attempts += 1;
    }

    pub fn charge_call(&mut self, stage: Stage) {
        self.usage.entry(stage).or_default().calls += 1;
    }

    pub fn charge_fix(&mut self, stage: Stage) {
        self.usage.entry(stage).or_default().fixes += 1;
    }

    /// Move forward within an iteration. Stages never move backwards.
    pub fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "illegal transition {} -> {}", self.stage, next);
        debug!(from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
    }

    /// Start a new outer iteration at `stage`
    pub fn restart_at(&mut self, stage: Stage) {
        debug!(from = %self.stage, to = %stage, "Iteration restart");
        self.stage = stage;
    }
}

/// Ranking key for candidate versions: fewer failures first, then lower
/// total distance. Ties keep the earlier version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub code: String,
    pub verdicts: Vec<TestVerdict>,
    failing: usize,
    distance: f64,
}

impl Snapshot {
    pub fn new(code: &str, verdicts: &[TestVerdict]) -> Self {
        Self {
            code: code.to_string(),
            verdicts: verdicts.to_vec(),
            failing: failing_count(verdicts),
            distance: total_distance(verdicts),
        }
    }

    pub fn failing(&self) -> usize {
        self.failing
    }

    /// Strictly better than `other`
    pub fn beats(&self, other: &Snapshot) -> bool {
        self.failing < other.failing
            || (self.failing == other.failing && self.distance < other.distance)
    }

    /// Tests passing in `self` that fail in `newer`
    pub fn regressions_in(&self, newer: &[TestVerdict]) -> usize {
        self.verdicts
            .iter()
            .zip(newer)
            .filter(|(old, new)| old.passed() && !new.passed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refine_common::types::VerdictStatus;

    fn verdict(index: usize, status: VerdictStatus, distance: Option<f64>) -> TestVerdict {
        TestVerdict {
            test_index: index,
            status,
            actual_output: String::new(),
            stderr: String::new(),
            execution_time_ms: 0,
            within_tolerance: false,
            distance,
            trace: None,
        }
    }

    #[test]
    fn test_budget_never_overspends() {
        let mut budget = Budget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 2);
        assert_eq!(budget.remaining(), 0);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_zero_budget() {
        let mut budget = Budget::new(0);
        assert!(budget.is_exhausted());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_replace_code_clears_verdicts() {
        let mut artifact = SolutionArtifact::new();
        artifact.replace_code("v1".to_string());
        artifact.record_verdicts(vec![verdict(0, VerdictStatus::Passed, Some(0.0))]);
        assert_eq!(artifact.verdicts().len(), 1);

        artifact.replace_code("v2".to_string());
        assert_eq!(artifact.code(), "v2");
        assert!(artifact.verdicts().is_empty());
    }

    #[test]
    fn test_usage_accumulates_per_stage() {
        let mut artifact = SolutionArtifact::new();
        artifact.charge_call(Stage::PublicTestFixLoop);
        artifact.charge_call(Stage::PublicTestFixLoop);
        artifact.charge_fix(Stage::PublicTestFixLoop);
        artifact.charge_call(Stage::SelfReflection);

        let usage = artifact.usage();
        assert_eq!(usage[&Stage::PublicTestFixLoop], StageUsage { calls: 2, fixes: 1 });
        assert_eq!(usage[&Stage::SelfReflection].calls, 1);
        assert!(!usage.contains_key(&Stage::AiTestFixLoop));
    }

    #[test]
    fn test_advance_moves_forward() {
        let mut artifact = SolutionArtifact::new();
        artifact.advance(Stage::PossibleSolutions);
        artifact.advance(Stage::ChooseApproach);
        assert_eq!(artifact.stage(), Stage::ChooseApproach);

        artifact.restart_at(Stage::PossibleSolutions);
        assert_eq!(artifact.stage(), Stage::PossibleSolutions);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    #[cfg(debug_assertions)]
    fn test_backward_transition_panics_in_debug() {
        let mut artifact = SolutionArtifact::new();
        artifact.advance(Stage::AiTestFixLoop);
        artifact.advance(Stage::PublicTestFixLoop);
    }

    #[test]
    fn test_snapshot_ranking() {
        let two_failing = Snapshot::new(
            "a",
            &[
                verdict(0, VerdictStatus::Mismatch, Some(1.0)),
                verdict(1, VerdictStatus::Mismatch, Some(1.0)),
            ],
        );
        let one_failing_far = Snapshot::new(
            "b",
            &[
                verdict(0, VerdictStatus::Passed, Some(0.0)),
                verdict(1, VerdictStatus::Timeout, None),
            ],
        );
        let one_failing_near = Snapshot::new(
            "c",
            &[
                verdict(0, VerdictStatus::Passed, Some(0.0)),
                verdict(1, VerdictStatus::Mismatch, Some(3.0)),
            ],
        );

        assert!(one_failing_far.beats(&two_failing));
        assert!(one_failing_near.beats(&one_failing_far));
        assert!(!one_failing_near.beats(&one_failing_near.clone()));
    }

    #[test]
    fn test_regressions() {
        let best = Snapshot::new(
            "a",
            &[
                verdict(0, VerdictStatus::Passed, Some(0.0)),
                verdict(1, VerdictStatus::Mismatch, Some(1.0)),
            ],
        );
        let newer = vec![
            verdict(0, VerdictStatus::RuntimeFailure, None),
            verdict(1, VerdictStatus::Passed, Some(0.0)),
        ];
        assert_eq!(best.regressions_in(&newer), 1);
    }
}
