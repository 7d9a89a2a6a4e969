//! Validation report: summary counts, per-code breakdown and a finding list
//! capped per code.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use datakit_types::finding::{worst_severity, RuleCategory, Severity, ValidationFinding};
use datakit_types::state::Disposition;
use serde::{Deserialize, Serialize};

pub const SUMMARY_FILE: &str = "validation_summary.json";
pub const FINDINGS_FILE: &str = "findings.csv";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_episodes: u64,
    /// No finding above INFO.
    pub valid_episodes: u64,
    /// Worst finding is WARN; written but flagged.
    pub invalid_episodes: u64,
    /// At least one ERROR finding.
    pub error_episodes: u64,
    pub accepted: u64,
    pub quarantined: u64,
    pub rejected: u64,
    pub error_count: u64,
    pub warn_count: u64,
    pub info_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSummary {
    pub category: RuleCategory,
    pub severity: Severity,
    pub count: u64,
    pub episodes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub summary: ReportSummary,
    pub by_code: BTreeMap<String, CodeSummary>,
    pub findings: Vec<ValidationFinding>,
    /// Set when the per-code cap dropped findings from `findings`.
    pub truncated: bool,
}

impl ValidationReport {
    /// Fraction of episodes with WARN-or-worse findings.
    #[must_use]
    pub fn invalid_ratio(&self) -> f64 {
        if self.summary.total_episodes == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = (self.summary.invalid_episodes + self.summary.error_episodes) as f64
            / self.summary.total_episodes as f64;
        ratio
    }

    /// Write `validation_summary.json` and `findings.csv` under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or either file cannot be written.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report dir {}", dir.display()))?;
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize report")?;
        std::fs::write(dir.join(SUMMARY_FILE), json)
            .with_context(|| format!("Failed to write {SUMMARY_FILE}"))?;
        std::fs::write(dir.join(FINDINGS_FILE), self.to_csv())
            .with_context(|| format!("Failed to write {FINDINGS_FILE}"))?;
        Ok(())
    }

    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out =
            String::from("episode_id,step_index,code,category,severity,field,message,value\n");
        for f in &self.findings {
            let step = f.step_index.map(|s| s.to_string()).unwrap_or_default();
            let value = f.value.as_ref().map(ToString::to_string).unwrap_or_default();
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{},{}",
                csv_field(&f.episode_id),
                step,
                csv_field(&f.code),
                f.category,
                f.severity,
                csv_field(f.field.as_deref().unwrap_or("")),
                csv_field(&f.message),
                csv_field(&value),
            );
        }
        out
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Accumulates per-episode outcomes into a [`ValidationReport`].
#[derive(Debug)]
pub struct ReportBuilder {
    max_per_code: usize,
    report: ValidationReport,
    kept: HashMap<String, usize>,
}

impl ReportBuilder {
    #[must_use]
    pub fn new(max_per_code: usize) -> Self {
        Self {
            max_per_code,
            report: ValidationReport::default(),
            kept: HashMap::new(),
        }
    }

    /// Record one disposed episode and its findings.
    pub fn record(&mut self, disposition: Disposition, findings: &[ValidationFinding]) {
        let summary = &mut self.report.summary;
        summary.total_episodes += 1;
        match disposition {
            Disposition::Accepted => summary.accepted += 1,
            Disposition::Quarantined => summary.quarantined += 1,
            Disposition::Rejected => summary.rejected += 1,
        }
        match worst_severity(findings) {
            Some(Severity::Error) => summary.error_episodes += 1,
            Some(Severity::Warn) => summary.invalid_episodes += 1,
            Some(Severity::Info) | None => summary.valid_episodes += 1,
        }

        let mut seen_codes: Vec<&str> = Vec::new();
        for finding in findings {
            match finding.severity {
                Severity::Error => summary.error_count += 1,
                Severity::Warn => summary.warn_count += 1,
                Severity::Info => summary.info_count += 1,
            }
            let entry = self
                .report
                .by_code
                .entry(finding.code.clone())
                .or_insert_with(|| CodeSummary {
                    category: finding.category,
                    severity: finding.severity,
                    count: 0,
                    episodes: 0,
                });
            entry.count += 1;
            if !seen_codes.contains(&finding.code.as_str()) {
                entry.episodes += 1;
                seen_codes.push(&finding.code);
            }

            let kept = self.kept.entry(finding.code.clone()).or_insert(0);
            if *kept < self.max_per_code {
                *kept += 1;
                self.report.findings.push(finding.clone());
            } else {
                self.report.truncated = true;
            }
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.report.summary.total_episodes
    }

    #[must_use]
    pub fn finish(self) -> ValidationReport {
        self.report
    }
}
