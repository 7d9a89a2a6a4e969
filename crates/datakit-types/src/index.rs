//! Relational per-episode index records.
//!
//! An [`EpisodeIndexRecord`] is the only durable handle on an episode after
//! it is written: its shard references are the source of truth for
//! reconstructing the episode's steps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Rows of one episode, as global row indices of its partition. The range
/// always falls inside the single data shard named by `shard_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataShardRef {
    pub shard_id: u32,
    pub row_start: u64,
    pub row_count: u64,
}

impl DataShardRef {
    /// Exclusive end row.
    #[must_use]
    pub fn row_end(&self) -> u64 {
        self.row_start + self.row_count
    }
}

/// Frame range of one episode inside a per-camera video shard. Frame
/// offsets are local to the video file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoShardRef {
    /// Observation key the frames belong to.
    pub key: String,
    pub shard_id: u32,
    pub frame_start: u64,
    pub frame_count: u64,
}

/// One row of `meta/episodes/*.parquet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeIndexRecord {
    pub episode_id: String,
    pub dataset_id: String,
    pub source_episode_index: u64,
    pub invalid: bool,
    pub num_steps: u64,
    pub task_id: u32,
    pub task_text: String,
    pub robot_id: String,
    pub split: String,
    pub duration_secs: f64,
    /// Comma-joined, sorted camera names.
    pub camera_set: String,
    pub action_space_type: String,
    pub source_uri: String,
    pub data: DataShardRef,
    #[serde(default)]
    pub videos: Vec<VideoShardRef>,
    /// Carried through unmodified for readers and exporters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub episode_metadata: BTreeMap<String, serde_json::Value>,
}

impl EpisodeIndexRecord {
    /// Video reference for an observation key, if the episode has one.
    #[must_use]
    pub fn video(&self, key: &str) -> Option<&VideoShardRef> {
        self.videos.iter().find(|v| v.key == key)
    }
}
