//! Output directory preparation for fresh and resumed builds.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use datakit_state::backend::CheckpointStore;
use datakit_state::sqlite::SqliteCheckpointStore;
use datakit_types::provenance::BuildId;
use datakit_types::state::{Checkpoint, Partition};

use crate::storage::layout::TMP_SUFFIX;
use crate::storage::DatasetLayout;

/// Checkpoint store plus the progress to continue from, if any.
pub struct PreparedOutput {
    pub store: Arc<dyn CheckpointStore>,
    pub checkpoint: Option<Checkpoint>,
    pub orphans_removed: usize,
}

impl std::fmt::Debug for PreparedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedOutput")
            .field("checkpoint", &self.checkpoint.as_ref().map(|c| c.shards.len()))
            .field("orphans_removed", &self.orphans_removed)
            .finish_non_exhaustive()
    }
}

/// Remove everything a previous run may have written. Unrelated files in
/// the output directory are left alone.
pub fn clean_output(layout: &DatasetLayout) -> Result<()> {
    for entry in layout.artefact_entries() {
        if entry.is_dir() {
            std::fs::remove_dir_all(&entry).with_context(|| format!("Failed to remove {}", entry.display()))?;
        } else if entry.exists() {
            std::fs::remove_file(&entry).with_context(|| format!("Failed to remove {}", entry.display()))?;
        }
    }
    Ok(())
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Delete shard files no committed shard references, and every staging
/// file. Returns how many files were removed.
pub fn remove_orphans(layout: &DatasetLayout, checkpoint: &Checkpoint) -> Result<usize> {
    let referenced: HashSet<PathBuf> = checkpoint
        .shards
        .iter()
        .flat_map(|shard| {
            [shard.path.as_str(), shard.index_path.as_str()]
                .into_iter()
                .chain(shard.videos.iter().map(|v| v.path.as_str()))
                .map(|rel| layout.resolve(rel))
                .collect::<Vec<_>>()
        })
        .collect();

    let mut candidates = Vec::new();
    for partition in [Partition::Main, Partition::Quarantine] {
        for dir in layout.shard_dirs(partition) {
            walk_files(&dir, &mut candidates)?;
        }
    }
    let mut removed = 0;
    for path in candidates {
        let staging = path.to_string_lossy().ends_with(TMP_SUFFIX);
        if staging || !referenced.contains(&path) {
            std::fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
            tracing::debug!(path = %path.display(), "Removed orphaned shard file");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Open the checkpoint store under `layout` for `build`.
///
/// With `resume`, committed progress of the same build is kept and orphans
/// from the interrupted run are deleted. Otherwise, or when the store holds
/// nothing for this build, the output is rebuilt from scratch.
pub fn prepare_output(layout: &DatasetLayout, build: &BuildId, resume: bool) -> Result<PreparedOutput> {
    let db = layout.checkpoint_db();
    if resume && db.exists() {
        let store = SqliteCheckpointStore::open(&db).context("Failed to open checkpoint store")?;
        if let Some(checkpoint) = store.load(build).context("Failed to load checkpoint")? {
            let orphans_removed = remove_orphans(layout, &checkpoint)?;
            tracing::info!(
                build_id = build.as_str(),
                shards = checkpoint.shards.len(),
                disposed = checkpoint.disposed.len(),
                orphans_removed,
                "Resuming from checkpoint"
            );
            return Ok(PreparedOutput {
                store: Arc::new(store),
                checkpoint: Some(checkpoint),
                orphans_removed,
            });
        }
        tracing::warn!(
            build_id = build.as_str(),
            "No checkpoint for this build id, starting a clean build"
        );
    }

    clean_output(layout)?;
    if let Some(parent) = db.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteCheckpointStore::open(&db).context("Failed to open checkpoint store")?;
    Ok(PreparedOutput {
        store: Arc::new(store),
        checkpoint: None,
        orphans_removed: 0,
    })
}
