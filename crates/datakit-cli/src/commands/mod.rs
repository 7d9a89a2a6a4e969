pub mod compile;
pub mod export;
pub mod query;
pub mod slice;
pub mod validate;

use std::path::Path;

use anyhow::anyhow;
use datakit_engine::index::PredicateError;
use datakit_engine::storage::DatasetLayout;
use datakit_engine::{CancelToken, CompileError, ExitStatus, Predicate};

/// A command that could not complete, with the status to exit with.
pub struct Failure {
    pub status: ExitStatus,
    pub error: anyhow::Error,
}

impl Failure {
    pub fn fatal(error: anyhow::Error) -> Self {
        Self {
            status: ExitStatus::Fatal,
            error,
        }
    }
}

impl From<CompileError> for Failure {
    fn from(e: CompileError) -> Self {
        Self {
            status: e.exit_status(),
            error: anyhow::Error::new(e),
        }
    }
}

impl From<PredicateError> for Failure {
    fn from(e: PredicateError) -> Self {
        Self {
            status: ExitStatus::Fatal,
            error: anyhow::Error::new(e).context("Invalid predicate"),
        }
    }
}

pub type Outcome = Result<ExitStatus, Failure>;

/// Parse an optional `--where` expression; absent means every episode.
pub fn parse_predicate(raw: Option<&str>) -> Result<Predicate, Failure> {
    Ok(raw.map(Predicate::parse).transpose()?.unwrap_or_else(Predicate::all))
}

/// Fail with exit code 1 unless `dir` holds a finalized dataset.
pub fn require_dataset(dir: &Path) -> Result<DatasetLayout, Failure> {
    let layout = DatasetLayout::new(dir);
    if !dir.is_dir() {
        return Err(Failure {
            status: ExitStatus::InputNotFound,
            error: anyhow!("dataset not found: {}", dir.display()),
        });
    }
    Ok(layout)
}

/// Cancel `token` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(token: &CancelToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after in-flight episodes");
            token.cancel();
        }
    });
}
