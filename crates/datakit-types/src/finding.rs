//! Severity-graded validation findings.

use serde::{Deserialize, Serialize};

/// Finding severity. Ordered `Info < Warn < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "warn", alias = "WARNING", alias = "warning")]
    Warn,
    #[serde(alias = "error")]
    Error,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    /// Case-insensitive parse of `INFO`, `WARN`/`WARNING`, `ERROR`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule family a finding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Structural,
    Semantic,
    Numeric,
    Temporal,
    Media,
    Metadata,
    /// Failures raised by the transform pipeline.
    Transform,
}

impl RuleCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Semantic => "semantic",
            Self::Numeric => "numeric",
            Self::Temporal => "temporal",
            Self::Media => "media",
            Self::Metadata => "metadata",
            Self::Transform => "transform",
        }
    }
}

impl std::fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fact about one episode from one compilation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub episode_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub code: String,
    pub category: RuleCategory,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Worst severity across `findings`, or `None` when there are none.
#[must_use]
pub fn worst_severity(findings: &[ValidationFinding]) -> Option<Severity> {
    findings.iter().map(|f| f.severity).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity) -> ValidationFinding {
        ValidationFinding {
            episode_id: "e".into(),
            step_index: None,
            code: "X".into(),
            category: RuleCategory::Structural,
            severity,
            message: String::new(),
            field: None,
            value: None,
        }
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Error);
    }

    #[test]
    fn severity_parse_accepts_aliases() {
        assert_eq!(Severity::parse("warning"), Some(Severity::Warn));
        assert_eq!(Severity::parse("Error"), Some(Severity::Error));
        assert_eq!(Severity::parse("fatal"), None);
    }

    #[test]
    fn severity_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Severity::Warn).unwrap(), "\"WARN\"");
    }

    #[test]
    fn worst_of_mixed_findings() {
        let findings = vec![finding(Severity::Info), finding(Severity::Error), finding(Severity::Warn)];
        assert_eq!(worst_severity(&findings), Some(Severity::Error));
        assert_eq!(worst_severity(&[]), None);
    }
}
