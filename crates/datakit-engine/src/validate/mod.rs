//! Severity-graded episode validation.
//!
//! A [`RuleRegistry`] maps rule codes to check functions with a default
//! severity and category. A [`ValidationEngine`] is built from a registry
//! plus the validation config: overrides and strict mode are merged once,
//! at construction, into a [`SeverityPolicy`].

pub mod report;
pub mod rules;
pub mod severity;

use std::collections::HashSet;

use anyhow::{bail, Result};
use datakit_types::episode::Episode;
use datakit_types::finding::{worst_severity, RuleCategory, Severity, ValidationFinding};
use datakit_types::spec::DatasetSpec;

use crate::config::types::ValidationConfig;

pub use severity::SeverityPolicy;

/// Code of the synthetic finding raised for transform failures.
pub const TRANSFORM_FAILURE_CODE: &str = "X900";

/// Inputs available to every rule besides the episode itself.
pub struct RuleContext<'a> {
    pub spec: &'a DatasetSpec,
    pub config: &'a ValidationConfig,
}

/// A raw rule observation. The engine stamps it with the rule's code,
/// category and effective severity.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub step_index: Option<usize>,
    pub message: String,
    pub field: Option<String>,
    pub value: Option<serde_json::Value>,
}

impl Hit {
    pub fn episode(message: impl Into<String>) -> Self {
        Self {
            step_index: None,
            message: message.into(),
            field: None,
            value: None,
        }
    }

    pub fn step(step_index: usize, message: impl Into<String>) -> Self {
        Self {
            step_index: Some(step_index),
            ..Self::episode(message)
        }
    }

    #[must_use]
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    #[must_use]
    pub fn value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Signature every rule implements.
pub type CheckFn = fn(&Episode, &RuleContext<'_>) -> Vec<Hit>;

/// Registry entry for one rule.
#[derive(Debug, Clone, Copy)]
pub struct RuleDef {
    pub code: &'static str,
    pub category: RuleCategory,
    pub default_severity: Severity,
    /// "MAY" rules only run in strict mode.
    pub optional: bool,
    pub description: &'static str,
    pub check: CheckFn,
}

/// Rule code to definition, in registration order.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<RuleDef>,
}

impl RuleRegistry {
    /// Registry populated with the built-in rule table.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self {
            rules: rules::builtin_rules(),
        }
    }

    /// Add an external rule.
    ///
    /// # Errors
    ///
    /// Fails if a rule with the same code is already registered.
    pub fn register(&mut self, rule: RuleDef) -> Result<()> {
        if rule.code == TRANSFORM_FAILURE_CODE || self.get(rule.code).is_some() {
            bail!("Rule code '{}' is already registered", rule.code);
        }
        self.rules.push(rule);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, code: &str) -> Option<&RuleDef> {
        self.rules.iter().find(|r| r.code == code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleDef> {
        self.rules.iter()
    }

    /// Default severity for `code`, including the synthetic transform code.
    #[must_use]
    pub fn default_severity(&self, code: &str) -> Option<Severity> {
        if code == TRANSFORM_FAILURE_CODE {
            return Some(Severity::Error);
        }
        self.get(code).map(|r| r.default_severity)
    }
}

/// Outcome of running the full rule set against one episode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeValidation {
    /// Sorted by step, code, field and message.
    pub findings: Vec<ValidationFinding>,
    pub worst: Option<Severity>,
}

impl EpisodeValidation {
    /// Findings for an episode whose transform pipeline failed.
    #[must_use]
    pub fn from_transform_failure(finding: ValidationFinding) -> Self {
        Self {
            worst: Some(finding.severity),
            findings: vec![finding],
        }
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.worst == Some(Severity::Error)
    }
}

/// Build the synthetic ERROR finding for a failed transform.
#[must_use]
pub fn transform_failure_finding(
    episode_id: &str,
    transform: &str,
    message: &str,
) -> ValidationFinding {
    ValidationFinding {
        episode_id: episode_id.to_string(),
        step_index: None,
        code: TRANSFORM_FAILURE_CODE.to_string(),
        category: RuleCategory::Transform,
        severity: Severity::Error,
        message: message.to_string(),
        field: Some(transform.to_string()),
        value: None,
    }
}

/// Enabled rules with their resolved severities.
pub struct ValidationEngine {
    rules: Vec<(RuleDef, Severity)>,
    config: ValidationConfig,
}

impl ValidationEngine {
    /// Resolve severities and select the enabled rules.
    ///
    /// # Errors
    ///
    /// Fails when the overrides in `config` would lower a severity, name an
    /// unknown code, or conflict with strict mode.
    pub fn new(registry: &RuleRegistry, config: &ValidationConfig) -> Result<Self> {
        let policy = SeverityPolicy::resolve(registry, config).map_err(|errors| {
            anyhow::anyhow!(
                "Invalid severity configuration:\n  - {}",
                errors.join("\n  - ")
            )
        })?;
        let rules = registry
            .iter()
            .filter(|rule| !rule.optional || config.strict)
            .map(|rule| (*rule, policy.effective(rule.code)))
            .collect();
        Ok(Self {
            rules,
            config: config.clone(),
        })
    }

    /// Codes of the rules that will run, in registration order.
    pub fn enabled_codes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|(rule, _)| rule.code)
    }

    #[must_use]
    pub fn severity_of(&self, code: &str) -> Option<Severity> {
        self.rules
            .iter()
            .find(|(rule, _)| rule.code == code)
            .map(|(_, severity)| *severity)
    }

    /// Run every enabled rule. Evaluation never stops early, so the
    /// finding list is complete even after the first ERROR.
    #[must_use]
    pub fn run(&self, episode: &Episode, spec: &DatasetSpec) -> EpisodeValidation {
        let ctx = RuleContext {
            spec,
            config: &self.config,
        };
        let mut findings = Vec::new();
        for (rule, severity) in &self.rules {
            for hit in (rule.check)(episode, &ctx) {
                findings.push(ValidationFinding {
                    episode_id: episode.episode_id.clone(),
                    step_index: hit.step_index,
                    code: rule.code.to_string(),
                    category: rule.category,
                    severity: *severity,
                    message: hit.message,
                    field: hit.field,
                    value: hit.value,
                });
            }
        }
        sort_findings(&mut findings);
        EpisodeValidation {
            worst: worst_severity(&findings),
            findings,
        }
    }
}

/// Canonical order, independent of rule execution order.
fn sort_findings(findings: &mut [ValidationFinding]) {
    findings.sort_by(|a, b| {
        (a.step_index, &a.code, &a.field, &a.message).cmp(&(
            b.step_index,
            &b.code,
            &b.field,
            &b.message,
        ))
    });
}

/// Codes registered more than once. Used by registry consistency tests.
#[must_use]
pub fn duplicate_codes(registry: &RuleRegistry) -> Vec<&'static str> {
    let mut seen = HashSet::new();
    registry
        .iter()
        .filter(|rule| !seen.insert(rule.code))
        .map(|rule| rule.code)
        .collect()
}
