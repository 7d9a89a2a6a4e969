//! Checkpoint and run-tracking model types.
//!
//! Pure data types used by `CheckpointStore` implementations. Kept in the
//! types crate so the engine and the state crate share them without a
//! circular dependency.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::finding::ValidationFinding;
use crate::manifest::ShardEntry;

// ---------------------------------------------------------------------------
// Partitions and dispositions
// ---------------------------------------------------------------------------

/// Output partition a shard belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Main,
    Quarantine,
}

impl Partition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Quarantine => "quarantine",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "main" => Some(Self::Main),
            "quarantine" => Some(Self::Quarantine),
            _ => None,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal disposition of one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Accepted,
    Quarantined,
    Rejected,
}

impl Disposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Quarantined => "quarantined",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "accepted" => Some(Self::Accepted),
            "quarantined" => Some(Self::Quarantined),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Terminal status of a compile run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    /// Stopped by fail-fast on an ERROR finding.
    Aborted,
    Interrupted,
    Failed,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters for one compile run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub episodes_seen: u64,
    pub episodes_skipped: u64,
    pub accepted: u64,
    pub quarantined: u64,
    pub rejected: u64,
    pub shards_committed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// One disposed episode as persisted in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisposedEpisode {
    pub episode_id: String,
    pub disposition: Disposition,
    /// Kept so a resumed run can reproduce the full report.
    #[serde(default)]
    pub findings: Vec<ValidationFinding>,
}

/// Everything persisted by one atomic checkpoint write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointCommit {
    /// The shard made durable by this commit, if any.
    pub shard: Option<ShardEntry>,
    /// Episodes disposed since the previous commit.
    pub disposed: Vec<DisposedEpisode>,
    /// Opaque writer snapshot (statistics, catalog, cursors) as JSON.
    pub writer_state: String,
}

/// Durable progress of one build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub build_id: String,
    /// Committed shards in commit order.
    pub shards: Vec<ShardEntry>,
    pub disposed: Vec<DisposedEpisode>,
    pub writer_state: Option<String>,
}

impl Checkpoint {
    #[must_use]
    pub fn disposed_ids(&self) -> HashSet<String> {
        self.disposed.iter().map(|d| d.episode_id.clone()).collect()
    }

    /// Highest committed shard id in `partition`.
    #[must_use]
    pub fn last_committed_shard(&self, partition: Partition) -> Option<u32> {
        self.shards
            .iter()
            .filter(|s| s.partition == partition)
            .map(|s| s.shard_id)
            .max()
    }
}
