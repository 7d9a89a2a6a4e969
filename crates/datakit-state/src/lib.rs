//! Checkpoint persistence for the datakit compiler.
//!
//! Provides the [`CheckpointStore`](backend::CheckpointStore) trait and a
//! [`SqliteCheckpointStore`](sqlite::SqliteCheckpointStore) implementation
//! for run history, committed shards and the disposed-episode set.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub mod prelude {
    pub use crate::backend::CheckpointStore;
    pub use crate::error::{Result, StateError};
    pub use crate::sqlite::SqliteCheckpointStore;
    pub use datakit_types::provenance::BuildId;
    pub use datakit_types::state::{
        Checkpoint, CheckpointCommit, DisposedEpisode, Disposition, Partition, RunStats,
        RunStatus,
    };
}
