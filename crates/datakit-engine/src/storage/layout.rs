//! On-disk layout of a compiled dataset.
//!
//! ```text
//! <root>/
//!   meta/{info.json,tasks.jsonl,stats.json,manifest.json,checksums.json}
//!   meta/episodes/shard-00000.parquet
//!   data/shard-00000.parquet
//!   videos/<camera>/shard-00000.rawv
//!   quarantine/...            same tree for quarantined episodes
//!   reports/{validation_summary.json,findings.csv}
//!   README.md
//!   .checkpoint/state.db
//! ```

use std::path::{Path, PathBuf};

use datakit_types::episode::camera_name;
use datakit_types::state::Partition;

pub const META_DIR: &str = "meta";
pub const DATA_DIR: &str = "data";
pub const EPISODES_DIR: &str = "meta/episodes";
pub const VIDEOS_DIR: &str = "videos";
pub const QUARANTINE_DIR: &str = "quarantine";
pub const REPORTS_DIR: &str = "reports";
pub const CHECKPOINT_DIR: &str = ".checkpoint";

pub const INFO_FILE: &str = "meta/info.json";
pub const TASKS_FILE: &str = "meta/tasks.jsonl";
pub const STATS_FILE: &str = "meta/stats.json";
pub const MANIFEST_FILE: &str = "meta/manifest.json";
pub const CHECKSUMS_FILE: &str = "meta/checksums.json";
pub const README_FILE: &str = "README.md";
pub const STATE_DB_FILE: &str = "state.db";

pub const TMP_SUFFIX: &str = ".tmp";

/// Path templates recorded in `info.json`.
pub const DATA_PATH_TEMPLATE: &str = "data/shard-{shard_id:05}.parquet";
pub const VIDEO_PATH_TEMPLATE: &str = "videos/{camera}/shard-{shard_id:05}.{ext}";

/// Resolves every artefact path under one output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory prefix of a partition, relative to the root.
    #[must_use]
    pub fn partition_prefix(partition: Partition) -> &'static str {
        match partition {
            Partition::Main => "",
            Partition::Quarantine => QUARANTINE_DIR,
        }
    }

    /// Root-relative path of `rel` inside `partition`, with `/` separators.
    #[must_use]
    pub fn relative(partition: Partition, rel: &str) -> String {
        match Self::partition_prefix(partition) {
            "" => rel.to_string(),
            prefix => format!("{prefix}/{rel}"),
        }
    }

    #[must_use]
    pub fn data_rel(partition: Partition, shard_id: u32) -> String {
        Self::relative(partition, &format!("{DATA_DIR}/shard-{shard_id:05}.parquet"))
    }

    #[must_use]
    pub fn index_rel(partition: Partition, shard_id: u32) -> String {
        Self::relative(partition, &format!("{EPISODES_DIR}/shard-{shard_id:05}.parquet"))
    }

    #[must_use]
    pub fn video_rel(partition: Partition, key: &str, shard_id: u32, ext: &str) -> String {
        Self::relative(
            partition,
            &format!("{VIDEOS_DIR}/{}/shard-{shard_id:05}.{ext}", video_dir_name(key)),
        )
    }

    /// Absolute path of a root-relative artefact path.
    #[must_use]
    pub fn resolve(&self, rel: &str) -> PathBuf {
        rel.split('/').fold(self.root.clone(), |path, part| path.join(part))
    }

    #[must_use]
    pub fn partition_file(&self, partition: Partition, rel: &str) -> PathBuf {
        self.resolve(&Self::relative(partition, rel))
    }

    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.root.join(REPORTS_DIR)
    }

    #[must_use]
    pub fn checkpoint_db(&self) -> PathBuf {
        self.root.join(CHECKPOINT_DIR).join(STATE_DB_FILE)
    }

    /// Directories that hold per-shard files for `partition`.
    #[must_use]
    pub fn shard_dirs(&self, partition: Partition) -> Vec<PathBuf> {
        [DATA_DIR, EPISODES_DIR, VIDEOS_DIR]
            .iter()
            .map(|dir| self.partition_file(partition, dir))
            .collect()
    }

    /// Every top-level entry a compile run may create, for clean rebuilds.
    #[must_use]
    pub fn artefact_entries(&self) -> Vec<PathBuf> {
        [
            META_DIR,
            DATA_DIR,
            VIDEOS_DIR,
            QUARANTINE_DIR,
            REPORTS_DIR,
            README_FILE,
            CHECKPOINT_DIR,
        ]
        .iter()
        .map(|entry| self.root.join(entry))
        .collect()
    }
}

/// Staging path for an artefact that is renamed into place on commit.
#[must_use]
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Directory name for a video key: its camera name, or the key itself.
#[must_use]
pub fn video_dir_name(key: &str) -> &str {
    camera_name(key).unwrap_or(key)
}

/// Shard id encoded in a `shard-NNNNN.*` file name.
#[must_use]
pub fn shard_id_of(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix("shard-")?.split('.').next()?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_and_quarantine_paths() {
        assert_eq!(
            DatasetLayout::data_rel(Partition::Main, 3),
            "data/shard-00003.parquet"
        );
        assert_eq!(
            DatasetLayout::index_rel(Partition::Quarantine, 12),
            "quarantine/meta/episodes/shard-00012.parquet"
        );
        assert_eq!(
            DatasetLayout::video_rel(Partition::Main, "observation.images.front", 0, "rawv"),
            "videos/front/shard-00000.rawv"
        );
    }

    #[test]
    fn test_resolve_and_tmp() {
        let layout = DatasetLayout::new("/out");
        let path = layout.resolve("data/shard-00000.parquet");
        assert_eq!(path, PathBuf::from("/out/data/shard-00000.parquet"));
        assert_eq!(tmp_path(&path), PathBuf::from("/out/data/shard-00000.parquet.tmp"));
    }

    #[test]
    fn test_shard_id_of() {
        assert_eq!(shard_id_of(Path::new("/x/shard-00042.parquet")), Some(42));
        assert_eq!(shard_id_of(Path::new("/x/shard-00042.parquet.tmp")), Some(42));
        assert_eq!(shard_id_of(Path::new("/x/info.json")), None);
    }
}
