use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Language of the candidate programs the pipeline generates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    Shell,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Shell => write!(f, "shell"),
        }
    }
}

/// A single input/expected-output pair.
///
/// Identity is the position inside the owning list; test cases are never
/// mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            explanation: None,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

/// Immutable problem statement supplied by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub public_tests: Vec<TestCase>,
}

/// A natural-language solution strategy proposed by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateApproach {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_brute_force: bool,
    /// Model-assessed fitness; higher ranks first.
    #[serde(default)]
    pub score: f64,
}

/// Outcome class of running one test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictStatus {
    Passed,
    /// Program ran to completion but printed the wrong answer
    Mismatch,
    /// Wall-clock limit exceeded; the process was killed
    Timeout,
    /// Crash, non-zero exit, or resource-limit violation
    RuntimeFailure,
}

/// Result of executing the current code against one test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVerdict {
    pub test_index: usize,
    pub status: VerdictStatus,
    pub actual_output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub execution_time_ms: u64,
    /// Exact text differed but every numeric token was within tolerance.
    #[serde(default)]
    pub within_tolerance: bool,
    /// Distance between expected and actual output; `None` when unmeasurable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl TestVerdict {
    pub fn passed(&self) -> bool {
        self.status == VerdictStatus::Passed
    }
}

/// Count failing verdicts in a batch
pub fn failing_count(verdicts: &[TestVerdict]) -> usize {
    verdicts.iter().filter(|v| !v.passed()).count()
}

/// Sum of per-test distances; infinite when any test is unmeasurable
pub fn total_distance(verdicts: &[TestVerdict]) -> f64 {
    verdicts
        .iter()
        .map(|v| v.distance.unwrap_or(f64::INFINITY))
        .sum()
}

/// Pipeline stage tags, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SelfReflection,
    PossibleSolutions,
    ChooseApproach,
    GenerateAiTests,
    InitialCodeGeneration,
    PublicTestFixLoop,
    AiTestFixLoop,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::SelfReflection => "self_reflection",
            Stage::PossibleSolutions => "possible_solutions",
            Stage::ChooseApproach => "choose_approach",
            Stage::GenerateAiTests => "generate_ai_tests",
            Stage::InitialCodeGeneration => "initial_code_generation",
            Stage::PublicTestFixLoop => "public_test_fix_loop",
            Stage::AiTestFixLoop => "ai_test_fix_loop",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Cumulative gateway calls and fix attempts charged to one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageUsage {
    pub calls: u32,
    pub fixes: u32,
}

/// Final result of one `solve` run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveOutcome {
    pub problem_name: String,
    pub final_code: String,
    /// Tests the final code was verified against; verdict indices refer here
    #[serde(default)]
    pub tests: Vec<TestCase>,
    pub verdicts: Vec<TestVerdict>,
    pub solved: bool,
    pub iterations_used: u32,
    pub generation_attempts: u32,
    #[serde(default)]
    pub stage_usage: BTreeMap<Stage, StageUsage>,
}

/// Queued request to solve a problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveJob {
    pub id: Uuid,
    pub problem: Problem,
    pub submitted_at: DateTime<Utc>,
}

impl SolveJob {
    pub fn new(problem: Problem) -> Self {
        Self {
            id: Uuid::new_v4(),
            problem,
            submitted_at: Utc::now(),
        }
    }
}

/// Stored record pairing a job with its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub outcome: SolveOutcome,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(status: VerdictStatus, distance: Option<f64>) -> TestVerdict {
        TestVerdict {
            test_index: 0,
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
    fn test_failing_count() {
        let verdicts = vec![
            verdict(VerdictStatus::Passed, Some(0.0)),
            verdict(VerdictStatus::Mismatch, Some(2.0)),
            verdict(VerdictStatus::Timeout, None),
        ];
        assert_eq!(failing_count(&verdicts), 2);
    }

    #[test]
    fn test_total_distance_infinite_when_unmeasurable() {
        let verdicts = vec![
            verdict(VerdictStatus::Passed, Some(0.0)),
            verdict(VerdictStatus::RuntimeFailure, None),
        ];
        assert!(total_distance(&verdicts).is_infinite());

        let verdicts = vec![
            verdict(VerdictStatus::Passed, Some(0.0)),
            verdict(VerdictStatus::Mismatch, Some(1.5)),
        ];
        assert_eq!(total_distance(&verdicts), 1.5);
    }

    #[test]
    fn test_problem_deserializes_without_tests() {
        let problem: Problem =
            serde_json::from_str(r#"{"name": "p", "description": "d"}"#).unwrap();
        assert!(problem.public_tests.is_empty());
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::SelfReflection < Stage::PossibleSolutions);
        assert!(Stage::AiTestFixLoop < Stage::Done);
        assert_eq!(Stage::PublicTestFixLoop.to_string(), "public_test_fix_loop");
    }
}
