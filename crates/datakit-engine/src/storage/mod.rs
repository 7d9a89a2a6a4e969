//! Physical dataset storage: shard files, the episode index, statistics,
//! video shards and completion metadata.

pub mod codec;
pub mod finalize;
pub mod index_file;
pub mod layout;
pub mod parquet;
pub mod reader;
pub mod stats;
pub mod video;
pub mod writer;

pub use finalize::{finalize_dataset, DatasetInfo, FinalizeInput, FinalizeSummary};
pub use layout::DatasetLayout;
pub use reader::DatasetReader;
pub use writer::{CheckpointSink, ShardLimits, ShardWriter, WrittenDataset};
