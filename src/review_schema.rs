use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "error", alias = "high")]
    Critical,
    #[serde(alias = "medium")]
    Warning,
    #[serde(alias = "low", alias = "suggestion")]
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

fn default_severity() -> Severity {
    Severity::Warning
}

fn default_confidence() -> f64 {
    0.5
}

/// One located, opinionated result produced by an analysis task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    /// Code fragment the finding refers to; an alternative to `line`.
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub category: Option<String>,
    pub message: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Id of the task that produced the finding.
    #[serde(default)]
    pub source: String,
}

/// A test file proposed by a test-scenario task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub file: String,
    pub content: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scenario: String,
    /// Outcome of running the scenario's verify command, when one ran.
    #[serde(default)]
    pub verified: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FindingsPayload {
    Wrapped { findings: Vec<Finding> },
    Bare(Vec<Finding>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TestsPayload {
    Wrapped { tests: Vec<GeneratedTest> },
    Bare(Vec<GeneratedTest>),
}

/// Parse findings from model output: either `{"findings": [...]}` or a bare
/// array, optionally wrapped in a markdown code fence.
///
/// Confidence is clamped to `[0, 1]` and every finding is tagged with
/// `source`.
pub fn parse_findings(raw: &str, source: &str) -> Result<Vec<Finding>> {
    let json = strip_markdown_fences(raw);
    let payload: FindingsPayload = serde_json::from_str(&json)
        .map_err(|e| Error::Schema(format!("failed to parse findings JSON: {e}")))?;
    let mut findings = match payload {
        FindingsPayload::Wrapped { findings } | FindingsPayload::Bare(findings) => findings,
    };
    for finding in &mut findings {
        finding.confidence = if finding.confidence.is_finite() {
            finding.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        finding.source = source.to_string();
    }
    Ok(findings)
}

/// Parse generated tests from model output, same envelope rules as
/// [`parse_findings`].
pub fn parse_generated_tests(raw: &str, scenario: &str) -> Result<Vec<GeneratedTest>> {
    let json = strip_markdown_fences(raw);
    let payload: TestsPayload = serde_json::from_str(&json)
        .map_err(|e| Error::Schema(format!("failed to parse generated tests JSON: {e}")))?;
    let mut tests = match payload {
        TestsPayload::Wrapped { tests } | TestsPayload::Bare(tests) => tests,
    };
    for test in &mut tests {
        test.scenario = scenario.to_string();
    }
    Ok(tests)
}

/// Remove markdown code fences from a string, returning the inner content.
/// Handles ` ```json `, ` ``` `, and bare JSON.
fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        // Skip the optional language tag on the opening fence line
        let after_tag = if let Some(pos) = rest.find('\n') {
            &rest[pos + 1..]
        } else {
            return String::new();
        };

        if let Some(pos) = after_tag.rfind("```") {
            return after_tag[..pos].trim().to_string();
        }
        return after_tag.trim().to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_findings() {
        let json = r#"{
            "findings": [
                {
                    "file": "src/main.rs",
                    "line": 42,
                    "severity": "critical",
                    "message": "SQL injection vulnerability",
                    "suggestion": "Use bound parameters",
                    "confidence": 0.9
                },
                {
                    "file": "src/lib.rs",
                    "snippet": "use std::fmt;",
                    "severity": "info",
                    "message": "Unused import"
                }
            ]
        }"#;
        let findings = parse_findings(json, "security").unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].line, Some(42));
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].source, "security");
        assert_eq!(findings[1].line, None);
        assert_eq!(findings[1].snippet.as_deref(), Some("use std::fmt;"));
        assert_eq!(findings[1].confidence, 0.5);
        assert_eq!(findings[1].suggestion, "");
    }

    #[test]
    fn test_parse_bare_array_in_fence() {
        let raw = "```json\n[{\"file\": \"a.rs\", \"line\": 1, \"message\": \"nit\"}]\n```";
        let findings = parse_findings(raw, "style").unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let raw = r#"[{"file": "a.rs", "message": "x", "confidence": 1.7},
                      {"file": "a.rs", "message": "y", "confidence": -3}]"#;
        let findings = parse_findings(raw, "t").unwrap();
        assert_eq!(findings[0].confidence, 1.0);
        assert_eq!(findings[1].confidence, 0.0);
    }

    #[test]
    fn test_severity_aliases() {
        let raw = r#"[{"file": "a.rs", "message": "x", "severity": "high"},
                      {"file": "a.rs", "message": "y", "severity": "low"}]"#;
        let findings = parse_findings(raw, "t").unwrap();
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[1].severity, Severity::Info);
    }

    #[test]
    fn test_missing_message_errors() {
        let raw = r#"[{"file": "a.rs", "line": 3}]"#;
        assert!(parse_findings(raw, "t").is_err());
    }

    #[test]
    fn test_not_json_errors() {
        let err = parse_findings("looks fine to me", "t").unwrap_err();
        assert!(err.to_string().contains("failed to parse findings JSON"));
    }

    #[test]
    fn test_parse_generated_tests() {
        let raw = r##"{"tests": [{"file": "tests/login.rs", "content": "#[test] fn t() {}"}]}"##;
        let tests = parse_generated_tests(raw, "login").unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].scenario, "login");
        assert_eq!(tests[0].verified, None);
    }

    #[test]
    fn test_strip_markdown_json_fence() {
        let input = "```json\n{\"findings\": []}\n```";
        assert_eq!(strip_markdown_fences(input), r#"{"findings": []}"#);
    }

    #[test]
    fn test_strip_no_fence_passthrough() {
        let input = r#"{"findings": []}"#;
        assert_eq!(strip_markdown_fences(input), r#"{"findings": []}"#);
    }

    #[test]
    fn test_strip_fence_with_surrounding_whitespace() {
        let input = "\n  ```json\n[]\n```  \n";
        assert_eq!(strip_markdown_fences(input), "[]");
    }
}
