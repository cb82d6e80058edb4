//! Prompt builders, one per model-calling stage.

use crate::backend::Prompt;
use crate::trace::clip_lines;
use refine_common::types::{
    CandidateApproach, Language, Problem, TestCase, TestVerdict, VerdictStatus,
};
use std::fmt::Write as _;

const STDERR_LINES: usize = 30;
const OUTPUT_LINES: usize = 40;

fn system(language: Language) -> String {
    format!(
        "You are an expert competitive programmer. Programs you write are {} programs \
         that read from standard input and write to standard output.",
        language_name(language)
    )
}

fn language_name(language: Language) -> &'static str {
    match language {
        Language::Python => "Python 3",
        Language::Shell => "POSIX sh",
    }
}

fn render_problem(out: &mut String, problem: &Problem) {
    let _ = writeln!(out, "Problem: {}\n", problem.name);
    let _ = writeln!(out, "{}\n", problem.description.trim());
    if problem.public_tests.is_empty() {
        return;
    }
    out.push_str("Example tests:\n");
    for (i, test) in problem.public_tests.iter().enumerate() {
        let _ = writeln!(
            out,
            "--- example {} ---\ninput:\n{}\nexpected output:\n{}",
            i + 1,
            test.input.trim_end(),
            test.expected_output.trim_end()
        );
    }
    out.push('\n');
}

fn render_reflection(out: &mut String, reflection: Option<&str>) {
    if let Some(reflection) = reflection {
        let _ = writeln!(out, "Self-reflection on the problem:\n{}\n", reflection.trim());
    }
}

pub fn self_reflection(problem: &Problem, language: Language) -> Prompt {
    let mut user = String::new();
    render_problem(&mut user, problem);
    user.push_str(
        "Reflect on the problem. Restate the goal, the input format, the output format \
         and every constraint as bullet points. Then explain, for each example test in \
         order, why its expected output is correct.",
    );
    Prompt::new(system(language), user)
}

pub fn possible_solutions(
    problem: &Problem,
    reflection: Option<&str>,
    max_solutions: usize,
    abandoned: &[CandidateApproach],
    language: Language,
) -> Prompt {
    let mut user = String::new();
    render_problem(&mut user, problem);
    render_reflection(&mut user, reflection);
    let _ = writeln!(
        user,
        "Propose up to {} conceptually different approaches to solve the problem. \
         Mark approaches that enumerate the whole search space as brute force and \
         score each approach from 0.0 to 1.0 by how likely it is to be correct and \
         fast enough.",
        max_solutions
    );
    if !abandoned.is_empty() {
        user.push_str("\nThese approaches were already tried and failed; do not repeat them:\n");
        for approach in abandoned {
            let _ = writeln!(user, "- {}: {}", approach.name, approach.content.trim());
        }
    }
    Prompt::new(system(language), user)
}

pub fn ai_tests(
    problem: &Problem,
    reflection: Option<&str>,
    count: usize,
    language: Language,
) -> Prompt {
    let mut user = String::new();
    render_problem(&mut user, problem);
    render_reflection(&mut user, reflection);
    let _ = writeln!(
        user,
        "Write {} additional tests that differ from the examples. Cover edge cases and \
         boundary values. The expected output must follow from the problem description \
         alone, written exactly as the program must print it.",
        count
    );
    Prompt::new(system(language), user)
}

pub fn initial_code(
    problem: &Problem,
    reflection: Option<&str>,
    approach: &CandidateApproach,
    previous_failure: Option<&str>,
    language: Language,
) -> Prompt {
    let mut user = String::new();
    render_problem(&mut user, problem);
    render_reflection(&mut user, reflection);
    let _ = writeln!(
        user,
        "Chosen approach: {}\n{}\n",
        approach.name,
        approach.content.trim()
    );
    let _ = writeln!(
        user,
        "Write a complete {} program implementing this approach. Read the input from \
         standard input and print only the answer.",
        language_name(language)
    );
    if let Some(failure) = previous_failure {
        let _ = writeln!(
            user,
            "\nA previous attempt did not run:\n{}",
            clip_lines(failure, STDERR_LINES)
        );
    }
    Prompt::new(system(language), user)
}

/// Inputs to a repair request
pub struct FixRequest<'a> {
    pub problem: &'a Problem,
    pub reflection: Option<&'a str>,
    pub approach: Option<&'a CandidateApproach>,
    pub code: &'a str,
    pub tests: &'a [TestCase],
    pub verdicts: &'a [TestVerdict],
    /// Indices of the failing tests this request should fix
    pub targets: &'a [usize],
    pub use_explanations: bool,
    pub use_trace: bool,
    pub language: Language,
}

fn describe_failure(verdict: &TestVerdict) -> &'static str {
    match verdict.status {
        VerdictStatus::Passed => "passed",
        VerdictStatus::Mismatch => "wrong answer",
        VerdictStatus::Timeout => "timed out, the program took too long",
        VerdictStatus::RuntimeFailure => "crashed or exited with an error",
    }
}

pub fn fix_code(request: &FixRequest<'_>) -> Prompt {
    let mut user = String::new();
    render_problem(&mut user, request.problem);
    render_reflection(&mut user, request.reflection);
    if let Some(approach) = request.approach {
        let _ = writeln!(user, "Intended approach: {}\n", approach.name);
    }
    let _ = writeln!(user, "Current code:\n```\n{}\n```\n", request.code.trim_end());

    let _ = writeln!(user, "The code fails {} test(s):", request.targets.len());
    for &index in request.targets {
        let (Some(test), Some(verdict)) = (request.tests.get(index), request.verdicts.get(index))
        else {
            continue;
        };
        let _ = writeln!(
            user,
            "--- test {} ({}) ---\ninput:\n{}\nexpected output:\n{}\nactual output:\n{}",
            index + 1,
            describe_failure(verdict),
            test.input.trim_end(),
            test.expected_output.trim_end(),
            clip_lines(verdict.actual_output.trim_end(), OUTPUT_LINES)
        );
        if !verdict.stderr.trim().is_empty() {
            let _ = writeln!(user, "stderr:\n{}", clip_lines(verdict.stderr.trim(), STDERR_LINES));
        }
        if request.use_explanations {
            if let Some(explanation) = &test.explanation {
                let _ = writeln!(user, "why the expected output is correct:\n{}", explanation.trim());
            }
        }
        if request.use_trace {
            if let Some(trace) = &verdict.trace {
                let _ = writeln!(user, "execution trace:\n{}", trace);
            }
        }
    }

    user.push_str(
        "\nExplain what went wrong, then give the complete corrected program. Keep \
         behavior that already works.",
    );
    Prompt::new(system(request.language), user)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem() -> Problem {
        Problem {
            name: "factorial".to_string(),
            description: "Print n! for the given n.".to_string(),
            public_tests: vec![TestCase::new("5", "120")],
        }
    }

    fn failing(index: usize) -> TestVerdict {
        TestVerdict {
            test_index: index,
            status: VerdictStatus::RuntimeFailure,
            actual_output: String::new(),
            stderr: "RecursionError: maximum recursion depth exceeded".to_string(),
            execution_time_ms: 5,
            within_tolerance: false,
            distance: None,
            trace: Some("call f(n=0)".to_string()),
        }
    }

    #[test]
    fn test_problem_and_examples_rendered() {
        let prompt = self_reflection(&problem(), Language::Python);
        assert!(prompt.system.contains("Python 3"));
        assert!(prompt.user.contains("Problem: factorial"));
        assert!(prompt.user.contains("expected output:\n120"));
    }

    #[test]
    fn test_abandoned_approaches_listed() {
        let abandoned = vec![CandidateApproach {
            name: "recursion".to_string(),
            content: "recurse".to_string(),
            is_brute_force: false,
            score: 0.5,
        }];
        let prompt = possible_solutions(&problem(), None, 3, &abandoned, Language::Python);
        assert!(prompt.user.contains("up to 3"));
        assert!(prompt.user.contains("- recursion: recurse"));
    }

    #[test]
    fn test_fix_prompt_includes_failure_details() {
        let tests = vec![
            TestCase::new("0", "1").with_explanation("0! is 1 by definition"),
            TestCase::new("5", "120"),
        ];
        let verdicts = vec![failing(0), failing(1)];
        let request = FixRequest {
            problem: &problem(),
            reflection: Some("- n >= 0"),
            approach: None,
            code: "print(f(int(input())))",
            tests: &tests,
            verdicts: &verdicts,
            targets: &[0],
            use_explanations: true,
            use_trace: true,
            language: Language::Python,
        };
        let prompt = fix_code(&request);

        assert!(prompt.user.contains("print(f(int(input())))"));
        assert!(prompt.user.contains("fails 1 test(s)"));
        assert!(prompt.user.contains("RecursionError"));
        assert!(prompt.user.contains("0! is 1 by definition"));
        assert!(prompt.user.contains("call f(n=0)"));
        assert!(!prompt.user.contains("--- test 2"));
    }

    #[test]
    fn test_fix_prompt_toggles() {
        let tests = vec![TestCase::new("0", "1").with_explanation("by definition")];
        let verdicts = vec![failing(0)];
        let request = FixRequest {
            problem: &problem(),
            reflection: None,
            approach: None,
            code: "x",
            tests: &tests,
            verdicts: &verdicts,
            targets: &[0],
            use_explanations: false,
            use_trace: false,
            language: Language::Python,
        };
        let prompt = fix_code(&request);
        assert!(!prompt.user.contains("by definition"));
        assert!(!prompt.user.contains("execution trace"));
    }
}
