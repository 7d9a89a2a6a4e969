//! Outcomes of compile and validate runs.

use std::path::PathBuf;

use datakit_types::provenance::BuildId;
use datakit_types::state::{Disposition, RunStats};

use crate::errors::ExitStatus;
use crate::storage::FinalizeSummary;
use crate::validate::report::ValidationReport;

/// Dispositions across the whole build, including episodes disposed by
/// earlier interrupted runs of the same build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispositionTally {
    pub accepted: u64,
    pub quarantined: u64,
    pub rejected: u64,
}

impl DispositionTally {
    pub fn add(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Accepted => self.accepted += 1,
            Disposition::Quarantined => self.quarantined += 1,
            Disposition::Rejected => self.rejected += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.accepted + self.quarantined + self.rejected
    }
}

/// Exit status of a completed compile.
///
/// Nothing accepted out of a non-empty input is a processing error. Any
/// rejected or quarantined episode, or an invalid ratio above
/// `max_invalid_ratio`, is a partial failure.
#[must_use]
pub fn completed_exit_status(
    tally: &DispositionTally,
    report: Option<&ValidationReport>,
    max_invalid_ratio: Option<f64>,
) -> ExitStatus {
    if tally.total() > 0 && tally.accepted == 0 {
        return ExitStatus::ValidationError;
    }
    if tally.rejected + tally.quarantined > 0 {
        return ExitStatus::PartialFailure;
    }
    match (report, max_invalid_ratio) {
        (Some(report), Some(max)) if report.invalid_ratio() > max => ExitStatus::PartialFailure,
        _ => ExitStatus::Success,
    }
}

/// Result of a successful compile run.
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub build_id: BuildId,
    pub output_dir: PathBuf,
    pub resumed: bool,
    /// Counters for this run only.
    pub stats: RunStats,
    pub tally: DispositionTally,
    /// `None` when validation was skipped.
    pub report: Option<ValidationReport>,
    pub finalize: FinalizeSummary,
    pub duration_secs: f64,
    pub exit_status: ExitStatus,
}

/// Result of a validate-only run.
#[derive(Debug, Clone)]
pub struct ValidateResult {
    pub report: ValidationReport,
    pub report_dir: Option<PathBuf>,
    pub duration_secs: f64,
    pub exit_status: ExitStatus,
}
