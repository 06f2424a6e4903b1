//! Execution feedback produced fresh for every attempt.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Error,
    Warning,
    Info,
}

/// One lint or type-checker finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    pub file: String,
    pub line: u32,
    pub column: u32,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

impl Finding {
    pub fn render(&self) -> String {
        match &self.code {
            Some(code) => format!("Line {}: [{}] {}", self.line, code, self.message),
            None => format!("Line {}: {}", self.line, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl TestOutcome {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: None,
        }
    }

    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: Some(message.into()),
        }
    }
}

/// Whether lint/type findings can fail a task on their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingPolicy {
    /// Findings are recorded but never fail the attempt.
    #[default]
    Advisory,
    /// Any `Error`-severity finding fails the attempt.
    Blocking,
}

/// Why an attempt failed. Drives the retry context handed to the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Syntax,
    Lint,
    Test,
    Generation,
    Environment,
    DuplicateSymbol,
    MalformedFragment,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Syntax => "syntax",
            FailureKind::Lint => "lint",
            FailureKind::Test => "test",
            FailureKind::Generation => "generation",
            FailureKind::Environment => "environment",
            FailureKind::DuplicateSymbol => "duplicate_symbol",
            FailureKind::MalformedFragment => "malformed_fragment",
        }
    }
}

/// An attempt-local error converted into feedback so it consumes a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of running and validating one fragment.
///
/// Built once per attempt and never mutated afterwards; `overall_pass` is
/// derived at construction (structural validity AND every test passed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFeedback {
    pub structurally_valid: bool,
    #[serde(default)]
    pub syntax_errors: Vec<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub tests: Vec<TestOutcome>,
    pub overall_pass: bool,
    pub summary: String,
    #[serde(default)]
    pub error: Option<AttemptError>,
}

impl ExecutionFeedback {
    pub fn new(structurally_valid: bool, findings: Vec<Finding>, tests: Vec<TestOutcome>) -> Self {
        let tests_passed = tests.iter().all(|t| t.passed);
        let overall_pass = structurally_valid && tests_passed;
        let passed = tests.iter().filter(|t| t.passed).count();
        let summary = if !structurally_valid {
            "Structural validation failed".to_string()
        } else if tests_passed {
            format!("All {} tests passed", tests.len())
        } else {
            let failed: Vec<_> = tests
                .iter()
                .filter(|t| !t.passed)
                .take(3)
                .map(|t| t.name.as_str())
                .collect();
            format!(
                "{}/{} tests passed. Failed: {}",
                passed,
                tests.len(),
                failed.join(", ")
            )
        };
        Self {
            structurally_valid,
            syntax_errors: Vec::new(),
            findings,
            tests,
            overall_pass,
            summary,
            error: None,
        }
    }

    /// Feedback for code that did not parse.
    pub fn invalid(syntax_errors: Vec<String>) -> Self {
        let summary = match syntax_errors.first() {
            Some(first) => format!("Syntax error: {}", first),
            None => "Syntax error".to_string(),
        };
        Self {
            structurally_valid: false,
            syntax_errors,
            findings: Vec::new(),
            tests: Vec::new(),
            overall_pass: false,
            summary,
            error: None,
        }
    }

    /// Synthesize failing feedback from an attempt-local error.
    pub fn from_error(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            structurally_valid: false,
            syntax_errors: Vec::new(),
            findings: Vec::new(),
            tests: Vec::new(),
            overall_pass: false,
            summary: format!("{} failure: {}", kind.as_str(), message),
            error: Some(AttemptError { kind, message }),
        }
    }

    fn blocking_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == FindingSeverity::Error)
    }

    /// Whether the attempt passes under the given finding policy.
    pub fn passes(&self, policy: FindingPolicy) -> bool {
        match policy {
            FindingPolicy::Advisory => self.overall_pass,
            FindingPolicy::Blocking => {
                self.overall_pass && self.blocking_findings().next().is_none()
            }
        }
    }

    /// Classify a failing attempt. Returns `None` when the attempt passes.
    pub fn failure_kind(&self, policy: FindingPolicy) -> Option<FailureKind> {
        if let Some(err) = &self.error {
            return Some(err.kind);
        }
        if !self.structurally_valid {
            return Some(FailureKind::Syntax);
        }
        if policy == FindingPolicy::Blocking && self.blocking_findings().next().is_some() {
            return Some(FailureKind::Lint);
        }
        if self.tests.iter().any(|t| !t.passed) {
            return Some(FailureKind::Test);
        }
        None
    }

    /// Human-readable failure details for the retry context.
    pub fn failure_details(&self, policy: FindingPolicy) -> String {
        match self.failure_kind(policy) {
            None => String::new(),
            Some(FailureKind::Syntax) if !self.syntax_errors.is_empty() => {
                self.syntax_errors.join("\n")
            }
            Some(FailureKind::Lint) => self
                .blocking_findings()
                .take(5)
                .map(Finding::render)
                .collect::<Vec<_>>()
                .join("\n"),
            Some(FailureKind::Test) => self
                .tests
                .iter()
                .filter(|t| !t.passed)
                .take(3)
                .map(|t| format!("{}: {}", t.name, t.message.as_deref().unwrap_or("failed")))
                .collect::<Vec<_>>()
                .join("\n"),
            Some(_) => match &self.error {
                Some(err) => err.message.clone(),
                None => self.summary.clone(),
            },
        }
    }
}
