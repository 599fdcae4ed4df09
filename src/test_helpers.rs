use crate::review_schema::{Finding, Severity};

/// Create a `Finding` with sensible defaults for tests.
pub fn make_finding(file: &str) -> Finding {
    Finding {
        file: file.to_string(),
        line: Some(1),
        snippet: None,
        severity: Severity::Warning,
        category: Some("correctness".to_string()),
        message: format!("possible null dereference in {file}"),
        suggestion: "check the value before use".to_string(),
        confidence: 0.5,
        source: "test".to_string(),
    }
}
