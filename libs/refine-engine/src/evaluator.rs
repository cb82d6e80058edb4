/// Test Evaluator - Output Comparison Logic
///
/// **Core Responsibility:**
/// Compare raw execution outputs against expected outputs and assign verdicts.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or local processes
/// - Knows nothing about language runtimes
/// - Pure function: (raw output, expected output, policy) -> verdict
///
/// **Normalization Rules:**
/// - Trim leading and trailing whitespace of the whole output: YES
/// - Trim trailing whitespace of each line (\r\n vs \n): YES
/// - Case sensitivity: YES
/// - Floating-point tolerance: per `ComparisonPolicy::numeric_tolerance`
/// - Line order: per `ComparisonPolicy::order_sensitive`

use crate::engine::RawExecution;
use refine_common::config::ComparisonPolicy;
use refine_common::types::{TestCase, TestVerdict, VerdictStatus};

/// Normalize output string for comparison
fn normalize_output(output: &str) -> &str {
    output.trim()
}

fn output_lines(output: &str) -> Vec<&str> {
    let normalized = normalize_output(output);
    if normalized.is_empty() {
        return Vec::new();
    }
    normalized.lines().map(str::trim_end).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMatch {
    Exact,
    Tolerant,
    Different,
}

fn match_lines(expected: &str, actual: &str, tolerance: Option<f64>) -> LineMatch {
    if expected == actual {
        return LineMatch::Exact;
    }
    let Some(delta) = tolerance else {
        return LineMatch::Different;
    };

    let expected_tokens: Vec<&str> = expected.split_whitespace().collect();
    let actual_tokens: Vec<&str> = actual.split_whitespace().collect();
    if expected_tokens.len() != actual_tokens.len() {
        return LineMatch::Different;
    }

    for (e, a) in expected_tokens.iter().zip(&actual_tokens) {
        if e == a {
            continue;
        }
        match (e.parse::<f64>(), a.parse::<f64>()) {
            (Ok(x), Ok(y)) if (x - y).abs() <= delta => {}
            _ => return LineMatch::Different,
        }
    }
    LineMatch::Tolerant
}

/// Result of comparing two outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparison {
    pub equal: bool,
    /// Equal only thanks to numeric tolerance
    pub within_tolerance: bool,
}

impl Comparison {
    fn unequal() -> Self {
        Self {
            equal: false,
            within_tolerance: false,
        }
    }

    fn from_matches(matches: impl IntoIterator<Item = LineMatch>) -> Self {
        let mut within_tolerance = false;
        for m in matches {
            match m {
                LineMatch::Exact => {}
                LineMatch::Tolerant => within_tolerance = true,
                LineMatch::Different => return Self::unequal(),
            }
        }
        Self {
            equal: true,
            within_tolerance,
        }
    }
}

/// Compare expected and actual program output under `policy`.
///
/// Order-insensitive comparison matches lines as a multiset: every expected
/// line must pair with a distinct actual line. An exact multiset match is
/// preferred; otherwise any one-to-one pairing within tolerance counts.
pub fn compare_outputs(expected: &str, actual: &str, policy: &ComparisonPolicy) -> Comparison {
    let expected_lines = output_lines(expected);
    let actual_lines = output_lines(actual);
    if expected_lines.len() != actual_lines.len() {
        return Comparison::unequal();
    }

    let tolerance = policy.numeric_tolerance;

    if policy.order_sensitive {
        return Comparison::from_matches(
            expected_lines
                .iter()
                .zip(&actual_lines)
                .map(|(e, a)| match_lines(e, a, tolerance)),
        );
    }

    let mut sorted_expected = expected_lines.clone();
    let mut sorted_actual = actual_lines.clone();
    sorted_expected.sort_unstable();
    sorted_actual.sort_unstable();
    if sorted_expected == sorted_actual {
        return Comparison::from_matches([LineMatch::Exact]);
    }
    if tolerance.is_none() {
        return Comparison::unequal();
    }

    if lines_pair_up(&expected_lines, &actual_lines, tolerance) {
        Comparison::from_matches([LineMatch::Tolerant])
    } else {
        Comparison::unequal()
    }
}

/// Whether every expected line pairs with a distinct compatible actual line.
///
/// Maximum bipartite matching with augmenting paths; the caller has already
/// ruled out an exact multiset match.
fn lines_pair_up(expected: &[&str], actual: &[&str], tolerance: Option<f64>) -> bool {
    let candidates: Vec<Vec<usize>> = expected
        .iter()
        .map(|e| {
            (0..actual.len())
                .filter(|&j| match_lines(e, actual[j], tolerance) != LineMatch::Different)
                .collect()
        })
        .collect();
    if candidates.iter().any(Vec::is_empty) {
        return false;
    }

    let mut owner: Vec<Option<usize>> = vec![None; actual.len()];
    for line in 0..expected.len() {
        let mut visited = vec![false; actual.len()];
        if !augment(line, &candidates, &mut owner, &mut visited) {
            return false;
        }
    }
    true
}

fn augment(
    line: usize,
    candidates: &[Vec<usize>],
    owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for &slot in &candidates[line] {
        if visited[slot] {
            continue;
        }
        visited[slot] = true;
        let free = match owner[slot] {
            None => true,
            Some(other) => augment(other, candidates, owner, visited),
        };
        if free {
            owner[slot] = Some(line);
            return true;
        }
    }
    false
}

/// Distance between expected and actual output.
///
/// Numeric token pairs contribute their absolute difference, any other
/// differing token or line contributes 1. `None` when there is no output
/// to measure.
pub fn output_distance(expected: &str, actual: &str) -> Option<f64> {
    let actual_lines = output_lines(actual);
    if actual_lines.is_empty() {
        return None;
    }
    let expected_lines = output_lines(expected);

    let mut distance = 0.0;
    for i in 0..expected_lines.len().max(actual_lines.len()) {
        match (expected_lines.get(i), actual_lines.get(i)) {
            (Some(e), Some(a)) => distance += line_distance(e, a),
            _ => distance += 1.0,
        }
    }
    Some(distance)
}

fn line_distance(expected: &str, actual: &str) -> f64 {
    if expected == actual {
        return 0.0;
    }
    let expected_tokens: Vec<&str> = expected.split_whitespace().collect();
    let actual_tokens: Vec<&str> = actual.split_whitespace().collect();

    let mut distance = 0.0;
    for i in 0..expected_tokens.len().max(actual_tokens.len()) {
        distance += match (expected_tokens.get(i), actual_tokens.get(i)) {
            (Some(e), Some(a)) if e == a => 0.0,
            (Some(e), Some(a)) => match (e.parse::<f64>(), a.parse::<f64>()) {
                (Ok(x), Ok(y)) if (x - y).is_finite() => (x - y).abs(),
                _ => 1.0,
            },
            _ => 1.0,
        };
    }
    distance
}

/// Evaluate a single test case execution output
///
/// Status priority:
/// 1. Runtime failure
/// 2. Timeout
/// 3. Output comparison
pub fn evaluate_test(
    test_index: usize,
    output: &RawExecution,
    test_case: &TestCase,
    policy: &ComparisonPolicy,
) -> TestVerdict {
    let mut within_tolerance = false;
    let status = if output.runtime_error {
        VerdictStatus::RuntimeFailure
    } else if output.timed_out {
        VerdictStatus::Timeout
    } else {
        let comparison = compare_outputs(&test_case.expected_output, &output.stdout, policy);
        within_tolerance = comparison.equal && comparison.within_tolerance;
        if comparison.equal {
            VerdictStatus::Passed
        } else {
            VerdictStatus::Mismatch
        }
    };

    let distance = match status {
        VerdictStatus::Passed => Some(0.0),
        VerdictStatus::Mismatch => output_distance(&test_case.expected_output, &output.stdout),
        VerdictStatus::Timeout | VerdictStatus::RuntimeFailure => None,
    };

    TestVerdict {
        test_index,
        status,
        actual_output: output.stdout.clone(),
        stderr: output.stderr.clone(),
        execution_time_ms: output.execution_time_ms,
        within_tolerance,
        distance,
        trace: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_case(input: &str, expected: &str) -> TestCase {
        TestCase::new(input, expected)
    }

    fn make_output(stdout: &str, stderr: &str, timed_out: bool, runtime_error: bool) -> RawExecution {
        RawExecution {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(if runtime_error { 1 } else { 0 }),
            execution_time_ms: 100,
            timed_out,
            runtime_error,
        }
    }

    fn policy(order_sensitive: bool, tolerance: Option<f64>) -> ComparisonPolicy {
        ComparisonPolicy {
            order_sensitive,
            numeric_tolerance: tolerance,
        }
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("  hello  "), "hello");
        assert_eq!(normalize_output("\nhello\n"), "hello");
        assert_eq!(normalize_output("hello\r\n"), "hello");
        assert_eq!(normalize_output("  hello world  "), "hello world");
    }

    #[test]
    fn test_evaluate_passed() {
        let test_case = make_test_case("5", "120");
        let output = make_output("120\n", "", false, false);
        let verdict = evaluate_test(0, &output, &test_case, &policy(true, None));

        assert_eq!(verdict.status, VerdictStatus::Passed);
        assert_eq!(verdict.distance, Some(0.0));
        assert!(!verdict.within_tolerance);
    }

    #[test]
    fn test_evaluate_mismatch() {
        let test_case = make_test_case("5", "120");
        let output = make_output("24\n", "", false, false);
        let verdict = evaluate_test(3, &output, &test_case, &policy(true, None));

        assert_eq!(verdict.test_index, 3);
        assert_eq!(verdict.status, VerdictStatus::Mismatch);
        assert_eq!(verdict.actual_output, "24\n");
        assert_eq!(verdict.distance, Some(96.0));
    }

    #[test]
    fn test_evaluate_timeout() {
        let test_case = make_test_case("5", "120");
        let output = make_output("", "[Execution timed out]", true, false);
        let verdict = evaluate_test(0, &output, &test_case, &policy(true, None));

        assert_eq!(verdict.status, VerdictStatus::Timeout);
        assert_eq!(verdict.distance, None);
    }

    #[test]
    fn test_runtime_error_has_priority() {
        // Even if output matches, a runtime error is still a failure
        let test_case = make_test_case("5", "120");
        let output = make_output("120", "Traceback", true, true);
        let verdict = evaluate_test(0, &output, &test_case, &policy(true, None));

        assert_eq!(verdict.status, VerdictStatus::RuntimeFailure);
        assert_eq!(verdict.stderr, "Traceback");
    }

    #[test]
    fn test_crlf_and_trailing_spaces_match() {
        let test_case = make_test_case("", "1 2\n3 4");
        let output = make_output("1 2  \r\n3 4\r\n", "", false, false);
        let verdict = evaluate_test(0, &output, &test_case, &policy(true, None));
        assert_eq!(verdict.status, VerdictStatus::Passed);
    }

    #[test]
    fn test_case_sensitive() {
        let comparison = compare_outputs("Hello", "hello", &policy(true, Some(1e-4)));
        assert!(!comparison.equal);
    }

    #[test]
    fn test_numeric_tolerance() {
        let loose = compare_outputs("3.14159", "3.14160", &policy(true, Some(1e-4)));
        assert!(loose.equal);
        assert!(loose.within_tolerance);

        let strict = compare_outputs("3.14159", "3.14160", &policy(true, Some(1e-5)));
        assert!(!strict.equal);

        let exact = compare_outputs("3.14159", "3.14160", &policy(true, None));
        assert!(!exact.equal);
    }

    #[test]
    fn test_tolerance_does_not_apply_to_words() {
        let comparison = compare_outputs("YES 1.0", "NO 1.0", &policy(true, Some(1e-4)));
        assert!(!comparison.equal);
    }

    #[test]
    fn test_tolerant_pass_is_flagged_on_verdict() {
        let test_case = make_test_case("", "0.5 0.25");
        let output = make_output("0.50001 0.25\n", "", false, false);
        let verdict = evaluate_test(0, &output, &test_case, &policy(true, Some(1e-4)));
        assert_eq!(verdict.status, VerdictStatus::Passed);
        assert!(verdict.within_tolerance);
    }

    #[test]
    fn test_line_order() {
        let sensitive = compare_outputs("a\nb", "b\na", &policy(true, None));
        assert!(!sensitive.equal);

        let insensitive = compare_outputs("a\nb", "b\na", &policy(false, None));
        assert!(insensitive.equal);
    }

    #[test]
    fn test_order_insensitive_is_multiset() {
        let p = policy(false, None);
        assert!(!compare_outputs("a\na\nb", "a\nb\nb", &p).equal);
        assert!(compare_outputs("a\na\nb", "b\na\na", &p).equal);
        assert!(!compare_outputs("a\nb", "a\nb\nc", &p).equal);
    }

    #[test]
    fn test_order_insensitive_prefers_exact_partner() {
        // A tolerant pairing of 1.0 with 1.00001 must not consume the exact
        // partner of the second expected line
        let p = policy(false, Some(1e-4));
        let comparison = compare_outputs("1.00001\n1.0", "1.0\n1.00001", &p);
        assert!(comparison.equal);
        assert!(!comparison.within_tolerance);
    }

    #[test]
    fn test_order_insensitive_finds_pairing_when_first_choice_blocks() {
        // 1.00005 could take 1.0, leaving 0.99995 with only 1.0001
        let p = policy(false, Some(1e-4));
        let comparison = compare_outputs("1.00005\n0.99995", "1.0\n1.0001", &p);
        assert!(comparison.equal);
        assert!(comparison.within_tolerance);

        // Pairing the exact 1.0 first would strand 0.99991
        let comparison = compare_outputs("1.0\n0.99991", "1.0\n1.00009", &p);
        assert!(comparison.equal);

        let strict = policy(false, Some(1e-5));
        assert!(!compare_outputs("1.00005\n0.99995", "1.0\n1.0001", &strict).equal);
    }

    #[test]
    fn test_empty_outputs() {
        let p = policy(true, None);
        assert!(compare_outputs("", "  \n", &p).equal);
        assert!(!compare_outputs("0", "", &p).equal);
    }

    #[test]
    fn test_distance() {
        assert_eq!(output_distance("10", "7"), Some(3.0));
        assert_eq!(output_distance("a b", "a c"), Some(1.0));
        assert_eq!(output_distance("1\n2", "1"), Some(1.0));
        assert_eq!(output_distance("1", ""), None);
    }
}
