//! Run-level error model and the exit-code contract.

use crate::source::SourceError;

// ---------------------------------------------------------------------------
// ExitStatus
// ---------------------------------------------------------------------------

/// Terminal state of a CLI-facing operation, one per exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    Success,
    /// The source (or an input dataset) does not exist.
    InputNotFound,
    /// Fail-fast abort, or nothing could be processed.
    ValidationError,
    /// Some episodes were rejected or quarantined, or the invalid-ratio
    /// threshold was breached.
    PartialFailure,
    /// Run-fatal: configuration, unreadable source, or I/O on commit.
    Fatal,
    Interrupted,
}

impl ExitStatus {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InputNotFound => 1,
            Self::ValidationError => 2,
            Self::PartialFailure => 3,
            Self::Fatal => 4,
            Self::Interrupted => 130,
        }
    }
}

// ---------------------------------------------------------------------------
// CompileError
// ---------------------------------------------------------------------------

/// Categorised run-level error.
///
/// Per-episode problems are findings, not errors; everything here ends the
/// run.
#[derive(Debug)]
pub enum CompileError {
    SourceNotFound(String),
    /// Malformed or semantically invalid configuration.
    Config(anyhow::Error),
    /// Fail-fast stopped the run on an ERROR finding.
    Aborted { episode_id: String, code: String },
    Interrupted,
    /// Unreadable source, shard commit I/O, checkpoint store, task panics.
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceNotFound(uri) => write!(f, "source not found: {uri}"),
            Self::Config(e) => write!(f, "invalid configuration: {e:#}"),
            Self::Aborted { episode_id, code } => write!(
                f,
                "fail-fast: episode '{episode_id}' raised ERROR finding {code}"
            ),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Infrastructure(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<anyhow::Error> for CompileError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<SourceError> for CompileError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::NotFound(uri) => Self::SourceNotFound(uri),
            other => Self::Infrastructure(other.into()),
        }
    }
}

impl From<datakit_state::error::StateError> for CompileError {
    fn from(e: datakit_state::error::StateError) -> Self {
        Self::Infrastructure(anyhow::Error::new(e).context("Checkpoint store failure"))
    }
}

impl CompileError {
    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::SourceNotFound(_) => ExitStatus::InputNotFound,
            Self::Aborted { .. } => ExitStatus::ValidationError,
            Self::Interrupted => ExitStatus::Interrupted,
            Self::Config(_) | Self::Infrastructure(_) => ExitStatus::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::InputNotFound.code(), 1);
        assert_eq!(ExitStatus::ValidationError.code(), 2);
        assert_eq!(ExitStatus::PartialFailure.code(), 3);
        assert_eq!(ExitStatus::Fatal.code(), 4);
        assert_eq!(ExitStatus::Interrupted.code(), 130);
    }

    #[test]
    fn test_source_errors_map_by_kind() {
        let missing: CompileError = SourceError::NotFound("/x".into()).into();
        assert_eq!(missing.exit_status(), ExitStatus::InputNotFound);

        let bad: CompileError = SourceError::InvalidSelector("[x]".into()).into();
        assert_eq!(bad.exit_status(), ExitStatus::Fatal);
    }

    #[test]
    fn test_compile_error_from_anyhow() {
        let err: CompileError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, CompileError::Infrastructure(_)));
        assert_eq!(err.exit_status(), ExitStatus::Fatal);
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn test_display_aborted() {
        let err = CompileError::Aborted {
            episode_id: "ep-7".into(),
            code: "S002".into(),
        };
        assert_eq!(err.exit_status(), ExitStatus::ValidationError);
        assert!(err.to_string().contains("ep-7"));
        assert!(err.to_string().contains("S002"));
    }
}
