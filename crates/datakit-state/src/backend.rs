//! Checkpoint store trait definition.
//!
//! [`CheckpointStore`] defines the storage contract for resumable builds:
//! run history, committed shards, the disposed-episode set and the writer
//! snapshot. Model types live in [`datakit_types::state`].

use datakit_types::provenance::BuildId;
use datakit_types::state::{Checkpoint, CheckpointCommit, RunStats, RunStatus};

use crate::error;

/// Storage contract for build checkpoints.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn CheckpointStore>`.
pub trait CheckpointStore: Send + Sync {
    /// Load the durable progress of `build`.
    ///
    /// Returns `Ok(None)` when nothing has been committed for this build.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure
    /// or when a stored payload cannot be decoded.
    fn load(&self, build: &BuildId) -> error::Result<Option<Checkpoint>>;

    /// Persist one shard commit and the dispositions made since the last
    /// commit. Either everything in `commit` becomes durable or nothing does.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn commit(&self, build: &BuildId, commit: &CheckpointCommit) -> error::Result<()>;

    /// Discard all progress recorded for `build` (non-resume runs).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn reset(&self, build: &BuildId) -> error::Result<()>;

    /// Begin a new compile run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, build: &BuildId, resumed: bool) -> error::Result<i64>;

    /// Finalize a compile run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats)
        -> error::Result<()>;
}
