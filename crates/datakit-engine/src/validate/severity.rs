//! Escalate-only severity resolution.
//!
//! Overrides are merged with rule defaults exactly once, when the engine is
//! constructed. Invalid overrides are load errors, never silently clamped.

use std::collections::HashMap;

use datakit_types::finding::Severity;

use super::{RuleRegistry, TRANSFORM_FAILURE_CODE};
use crate::config::types::ValidationConfig;

/// Resolved code -> effective severity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeverityPolicy {
    strict: bool,
    resolved: HashMap<String, Severity>,
}

impl SeverityPolicy {
    /// Merge `config.severity_overrides` into the registry defaults.
    ///
    /// Every problem is collected; the error lists all of them.
    ///
    /// # Errors
    ///
    /// - an override names a code absent from the registry
    /// - an override is below the rule's default severity
    /// - `strict` is on and an override pins a code at WARN, which strict
    ///   would otherwise escalate
    pub fn resolve(registry: &RuleRegistry, config: &ValidationConfig) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let mut resolved = HashMap::new();

        for rule in registry.iter() {
            resolved.insert(rule.code.to_string(), rule.default_severity);
        }
        resolved.insert(TRANSFORM_FAILURE_CODE.to_string(), Severity::Error);

        for (code, &requested) in &config.severity_overrides {
            let Some(default) = registry.default_severity(code) else {
                errors.push(format!("severity override for unknown rule code '{code}'"));
                continue;
            };
            if requested < default {
                errors.push(format!(
                    "severity override {code}={requested} is below the rule's floor {default}; overrides may only escalate"
                ));
                continue;
            }
            if config.strict && requested == Severity::Warn {
                errors.push(format!(
                    "severity override {code}=WARN conflicts with strict mode, which escalates WARN to ERROR"
                ));
                continue;
            }
            resolved.insert(code.clone(), requested);
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        if config.strict {
            for severity in resolved.values_mut() {
                if *severity == Severity::Warn {
                    *severity = Severity::Error;
                }
            }
        }
        Ok(Self {
            strict: config.strict,
            resolved,
        })
    }

    /// Effective severity of `code`. Unknown codes resolve to ERROR.
    #[must_use]
    pub fn effective(&self, code: &str) -> Severity {
        self.resolved.get(code).copied().unwrap_or(Severity::Error)
    }

    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }
}
