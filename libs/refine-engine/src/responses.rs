//! Structured model responses.
//!
//! Every gateway call declares the shape it expects by naming a type that
//! implements [`StructuredResponse`]. The gateway is the only place raw model
//! text is parsed; stage logic only ever sees validated values.

use refine_common::types::{CandidateApproach, TestCase};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

/// A response shape the gateway can parse and validate
pub trait StructuredResponse: DeserializeOwned + Send + 'static {
    /// Human-readable shape, embedded in prompts
    const SHAPE: &'static str;

    /// Semantic checks beyond deserialization
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Parse raw model text as YAML (JSON is accepted as a YAML subset)
pub fn parse_structured<T: StructuredResponse>(raw: &str) -> Result<T, String> {
    let body = strip_fences(raw);
    if body.trim().is_empty() {
        return Err("empty response".to_string());
    }
    let parsed: T = serde_yaml::from_str(body).map_err(|e| e.to_string())?;
    parsed.validate()?;
    Ok(parsed)
}

/// Remove a Markdown fence wrapped around the whole response, or extract
/// the first ```yaml / ```json block from surrounding chatter.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();

    if trimmed.starts_with("```") {
        let after_open = match trimmed.find('\n') {
            Some(pos) => &trimmed[pos + 1..],
            None => return "",
        };
        return after_open.trim_end().trim_end_matches('`').trim_end();
    }

    for opener in ["```yaml", "```yml", "```json"] {
        if let Some(start) = trimmed.find(opener) {
            let rest = &trimmed[start + opener.len()..];
            let rest = rest.strip_prefix('\n').unwrap_or(rest);
            return match rest.rfind("```") {
                Some(end) => &rest[..end],
                None => rest,
            };
        }
    }

    trimmed
}

/// Strip a code fence (```python ... ```) from a code field
pub fn clean_code(code: &str) -> String {
    let trimmed = code.trim();
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let body = match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => rest,
        };
        let body = match body.find("```") {
            Some(end) => &body[..end],
            None => body,
        };
        return body.trim_end().to_string() + "\n";
    }
    trimmed.to_string() + "\n"
}

/// Accept strings, numbers, booleans or lists of lines where text is expected
fn scalar_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    fn render(value: Value) -> Result<String, String> {
        match value {
            Value::Null => Ok(String::new()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            Value::String(s) => Ok(s),
            Value::Sequence(items) => {
                let lines: Result<Vec<String>, String> = items.into_iter().map(render).collect();
                Ok(lines?.join("\n"))
            }
            Value::Tagged(tagged) => {
                let tagged = *tagged;
                render(tagged.value)
            }
            Value::Mapping(_) => Err("expected text, found a mapping".to_string()),
        }
    }

    let value = Value::deserialize(deserializer)?;
    render(value).map_err(D::Error::custom)
}

fn optional_scalar_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let text = scalar_text(deserializer)?;
    Ok(if text.trim().is_empty() { None } else { Some(text) })
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestExplanation {
    #[serde(deserialize_with = "scalar_text")]
    pub input: String,
    #[serde(default, deserialize_with = "scalar_text")]
    pub output: String,
    #[serde(deserialize_with = "scalar_text")]
    pub explanation: String,
}

/// Restatement of the problem's requirements and constraints
#[derive(Debug, Clone, Deserialize)]
pub struct SelfReflection {
    #[serde(deserialize_with = "scalar_text")]
    pub self_reflection: String,
    #[serde(default)]
    pub tests_explanations: Vec<TestExplanation>,
}

impl StructuredResponse for SelfReflection {
    const SHAPE: &'static str = "self_reflection: |\n  <bullet points restating goals, inputs, outputs and constraints>\n\
tests_explanations:\n  - input: |\n      <public test input>\n    output: |\n      <expected output>\n    explanation: |\n      <why this output is correct>";

    fn validate(&self) -> Result<(), String> {
        if self.self_reflection.trim().is_empty() {
            return Err("self_reflection is empty".to_string());
        }
        Ok(())
    }
}

impl SelfReflection {
    /// Stricter check used when reflection validation is enabled: one
    /// non-empty explanation per public test at most.
    pub fn check_against(&self, public_tests: &[TestCase]) -> Result<(), String> {
        if self.tests_explanations.len() > public_tests.len() {
            return Err(format!(
                "{} test explanations for {} public tests",
                self.tests_explanations.len(),
                public_tests.len()
            ));
        }
        if let Some(pos) = self
            .tests_explanations
            .iter()
            .position(|e| e.explanation.trim().is_empty())
        {
            return Err(format!("explanation {} is empty", pos));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproachItem {
    #[serde(deserialize_with = "scalar_text")]
    pub name: String,
    #[serde(deserialize_with = "scalar_text")]
    pub content: String,
    #[serde(default)]
    pub is_brute_force: bool,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PossibleSolutions {
    pub possible_solutions: Vec<ApproachItem>,
}

impl StructuredResponse for PossibleSolutions {
    const SHAPE: &'static str = "possible_solutions:\n  - name: <short name>\n    content: |\n      <description of the approach>\n    is_brute_force: <true|false>\n    score: <0.0-1.0, how likely the approach is correct and fast enough>";

    fn validate(&self) -> Result<(), String> {
        if self.possible_solutions.is_empty() {
            return Err("no possible solutions".to_string());
        }
        if let Some(pos) = self
            .possible_solutions
            .iter()
            .position(|s| s.content.trim().is_empty())
        {
            return Err(format!("possible solution {} has no content", pos));
        }
        Ok(())
    }
}

impl PossibleSolutions {
    pub fn into_approaches(self) -> Vec<CandidateApproach> {
        self.possible_solutions
            .into_iter()
            .map(|item| CandidateApproach {
                name: item.name,
                content: item.content,
                is_brute_force: item.is_brute_force,
                score: if item.score.is_finite() { item.score } else { 0.0 },
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiTestItem {
    #[serde(deserialize_with = "scalar_text")]
    pub input: String,
    #[serde(deserialize_with = "scalar_text")]
    pub output: String,
    #[serde(default, deserialize_with = "optional_scalar_text")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiTests {
    pub tests: Vec<AiTestItem>,
}

impl StructuredResponse for AiTests {
    const SHAPE: &'static str = "tests:\n  - input: |\n      <exact stdin>\n    output: |\n      <exact expected stdout>\n    explanation: |\n      <short reasoning>";

    fn validate(&self) -> Result<(), String> {
        if self.tests.is_empty() {
            return Err("no tests generated".to_string());
        }
        Ok(())
    }
}

impl AiTests {
    pub fn into_test_cases(self) -> Vec<TestCase> {
        self.tests
            .into_iter()
            .map(|item| TestCase {
                input: item.input,
                expected_output: item.output,
                explanation: item.explanation,
            })
            .collect()
    }
}

/// A complete program
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedCode {
    #[serde(deserialize_with = "scalar_text")]
    pub code: String,
}

impl StructuredResponse for GeneratedCode {
    const SHAPE: &'static str = "code: |\n  <complete program reading stdin and writing stdout>";

    fn validate(&self) -> Result<(), String> {
        if clean_code(&self.code).trim().is_empty() {
            return Err("code is empty".to_string());
        }
        Ok(())
    }
}

/// A repaired program plus the model's diagnosis
#[derive(Debug, Clone, Deserialize)]
pub struct CodeFix {
    #[serde(default, deserialize_with = "scalar_text")]
    pub what_went_wrong: String,
    #[serde(deserialize_with = "scalar_text")]
    pub fixed_code: String,
}

impl StructuredResponse for CodeFix {
    const SHAPE: &'static str = "what_went_wrong: |\n  <diagnosis of the failing tests>\nfixed_code: |\n  <complete corrected program>";

    fn validate(&self) -> Result<(), String> {
        if clean_code(&self.fixed_code).trim().is_empty() {
            return Err("fixed_code is empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_yaml() {
        let raw = "self_reflection: |\n  - read n\n  - print n!\ntests_explanations: []\n";
        let parsed: SelfReflection = parse_structured(raw).unwrap();
        assert!(parsed.self_reflection.contains("print n!"));
    }

    #[test]
    fn test_parse_fenced_yaml() {
        let raw = "```yaml\ncode: |\n  print(1)\n```";
        let parsed: GeneratedCode = parse_structured(raw).unwrap();
        assert_eq!(parsed.code.trim(), "print(1)");
    }

    #[test]
    fn test_parse_yaml_block_inside_chatter() {
        let raw = "Here you go:\n```yaml\ntests:\n  - input: 5\n    output: 120\n```\nGood luck!";
        let parsed: AiTests = parse_structured(raw).unwrap();
        let tests = parsed.into_test_cases();
        assert_eq!(tests[0].input, "5");
        assert_eq!(tests[0].expected_output, "120");
        assert!(tests[0].explanation.is_none());
    }

    #[test]
    fn test_parse_json_response() {
        let raw = r#"{"possible_solutions": [{"name": "dp", "content": "use dp", "score": 0.9}]}"#;
        let parsed: PossibleSolutions = parse_structured(raw).unwrap();
        let approaches = parsed.into_approaches();
        assert_eq!(approaches[0].name, "dp");
        assert!(!approaches[0].is_brute_force);
        assert_eq!(approaches[0].score, 0.9);
    }

    #[test]
    fn test_list_input_joined_as_lines() {
        let raw = "tests:\n  - input: [3, '1 2 3']\n    output: '6'\n";
        let parsed: AiTests = parse_structured(raw).unwrap();
        assert_eq!(parsed.tests[0].input, "3\n1 2 3");
    }

    #[test]
    fn test_missing_field_is_invalid() {
        let raw = "what_went_wrong: nothing\n";
        assert!(parse_structured::<CodeFix>(raw).is_err());
    }

    #[test]
    fn test_semantic_validation_rejects_empty_code() {
        let raw = "code: ''\n";
        let err = parse_structured::<GeneratedCode>(raw).unwrap_err();
        assert!(err.contains("empty"));
    }

    #[test]
    fn test_empty_response_is_invalid() {
        assert!(parse_structured::<GeneratedCode>("   \n").is_err());
    }

    #[test]
    fn test_clean_code_strips_inner_fence() {
        let code = "```python\nn = int(input())\nprint(n)\n```";
        assert_eq!(clean_code(code), "n = int(input())\nprint(n)\n");
        assert_eq!(clean_code("print(1)"), "print(1)\n");
    }

    #[test]
    fn test_reflection_check_against_public_tests() {
        let reflection = SelfReflection {
            self_reflection: "ok".to_string(),
            tests_explanations: vec![TestExplanation {
                input: "1".to_string(),
                output: "1".to_string(),
                explanation: String::new(),
            }],
        };
        let tests = vec![TestCase::new("1", "1")];
        assert!(reflection.check_against(&tests).is_err());
        assert!(reflection.check_against(&[]).is_err());
    }
}
