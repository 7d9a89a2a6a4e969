//! Shared data model for the datakit dataset compiler.
//!
//! Episodes, schemas, findings, index records and checkpoint types live here
//! so the engine and the state backend can share them.

pub mod episode;
pub mod finding;
pub mod index;
pub mod manifest;
pub mod provenance;
pub mod spec;
pub mod state;
pub mod tasks;
pub mod tensor;

pub mod prelude {
    pub use crate::episode::{Episode, Step};
    pub use crate::finding::{RuleCategory, Severity, ValidationFinding};
    pub use crate::index::{DataShardRef, EpisodeIndexRecord, VideoShardRef};
    pub use crate::manifest::{ShardEntry, ShardEpisode, ShardManifest, VideoShardEntry};
    pub use crate::provenance::{BuildId, BuildProvenance, TransformStep};
    pub use crate::spec::{ActionSpaceType, DatasetSpec, FeatureSpec};
    pub use crate::state::{
        Checkpoint, CheckpointCommit, DisposedEpisode, Disposition, Partition, RunStats,
        RunStatus,
    };
    pub use crate::tasks::TaskCatalog;
    pub use crate::tensor::{DType, Tensor, TensorData};
}
