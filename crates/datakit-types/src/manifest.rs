//! Shard manifest: the physical layout contract of a compiled dataset.

use serde::{Deserialize, Serialize};

use crate::state::Partition;

/// Placement of one episode inside a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEpisode {
    pub episode_id: String,
    pub start: u64,
    pub length: u64,
}

/// One video file belonging to a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoShardEntry {
    pub key: String,
    /// Path relative to the dataset root.
    pub path: String,
    pub num_frames: u64,
    pub checksum: String,
}

/// One committed tabular shard and its companion files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub shard_id: u32,
    pub partition: Partition,
    /// Path relative to the dataset root.
    pub path: String,
    /// Relative path of the episode index batch for this shard.
    pub index_path: String,
    pub row_start: u64,
    pub row_end: u64,
    pub episodes: Vec<ShardEpisode>,
    /// Hex sha256 of the data file.
    pub checksum: String,
    #[serde(default)]
    pub videos: Vec<VideoShardEntry>,
}

impl ShardEntry {
    #[must_use]
    pub fn num_rows(&self) -> u64 {
        self.row_end - self.row_start
    }
}

/// All committed shards of a build, in commit order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardManifest {
    pub build_id: String,
    pub shards: Vec<ShardEntry>,
}

impl ShardManifest {
    pub fn partition(&self, partition: Partition) -> impl Iterator<Item = &ShardEntry> {
        self.shards.iter().filter(move |s| s.partition == partition)
    }

    /// Overlapping or out-of-range episode placements, as messages.
    #[must_use]
    pub fn overlap_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for shard in &self.shards {
            let mut spans: Vec<&ShardEpisode> = shard.episodes.iter().collect();
            spans.sort_by_key(|e| e.start);
            let mut cursor = shard.row_start;
            for ep in spans {
                if ep.start < cursor {
                    problems.push(format!(
                        "{} shard {}: episode '{}' starts at row {} inside previous episode (ends {})",
                        shard.partition, shard.shard_id, ep.episode_id, ep.start, cursor
                    ));
                }
                cursor = cursor.max(ep.start + ep.length);
            }
            if cursor > shard.row_end {
                problems.push(format!(
                    "{} shard {}: episodes end at row {} past shard end {}",
                    shard.partition, shard.shard_id, cursor, shard.row_end
                ));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(episodes: &[(&str, u64, u64)], row_end: u64) -> ShardEntry {
        ShardEntry {
            shard_id: 0,
            partition: Partition::Main,
            path: "data/shard-00000.parquet".into(),
            index_path: "meta/episodes/shard-00000.parquet".into(),
            row_start: 0,
            row_end,
            episodes: episodes
                .iter()
                .map(|(id, start, length)| ShardEpisode {
                    episode_id: (*id).to_string(),
                    start: *start,
                    length: *length,
                })
                .collect(),
            checksum: String::new(),
            videos: Vec::new(),
        }
    }

    #[test]
    fn contiguous_episodes_have_no_problems() {
        let manifest = ShardManifest {
            build_id: "b".into(),
            shards: vec![entry(&[("a", 0, 5), ("b", 5, 3)], 8)],
        };
        assert!(manifest.overlap_problems().is_empty());
    }

    #[test]
    fn overlap_is_reported() {
        let manifest = ShardManifest {
            build_id: "b".into(),
            shards: vec![entry(&[("a", 0, 5), ("b", 4, 3)], 8)],
        };
        let problems = manifest.overlap_problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("'b'"));
    }

    #[test]
    fn overrun_is_reported() {
        let manifest = ShardManifest {
            build_id: "b".into(),
            shards: vec![entry(&[("a", 0, 10)], 8)],
        };
        assert_eq!(manifest.overlap_problems().len(), 1);
    }
}
