//! Dataset slices selected by a predicate.
//!
//! A `copy` slice re-shards the matching episodes into a new, complete
//! dataset. A `view` slice only records the parent dataset, its build id
//! and the matching ids; it becomes invalid once the parent is rebuilt.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use datakit_types::index::EpisodeIndexRecord;
use datakit_types::provenance::{BuildId, TransformStep};
use datakit_types::state::Partition;
use serde::{Deserialize, Serialize};

use super::{EpisodeIndex, Predicate};
use crate::storage::finalize::{read_info, write_json};
use crate::storage::parquet::sha256_hex;
use crate::storage::{finalize_dataset, DatasetLayout, DatasetReader, FinalizeInput, ShardLimits, ShardWriter};

pub const SLICE_MANIFEST_FILE: &str = "slice_manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceMode {
    Copy,
    View,
}

impl SliceMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::View => "view",
        }
    }
}

impl std::fmt::Display for SliceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SliceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(Self::Copy),
            "view" => Ok(Self::View),
            other => Err(format!("unknown slice mode '{other}', expected copy or view")),
        }
    }
}

/// Contents of `slice_manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceManifest {
    pub slice_id: String,
    pub mode: SliceMode,
    pub parent_dataset: PathBuf,
    pub parent_build_id: String,
    pub predicate: String,
    pub episode_ids: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct SliceRequest<'a> {
    pub source: &'a Path,
    pub output: &'a Path,
    pub predicate: &'a Predicate,
    pub mode: SliceMode,
    pub slice_id: Option<String>,
    /// Shard thresholds for `copy` slices.
    pub limits: ShardLimits,
}

fn derived_id(parent: &str, predicate: &Predicate) -> String {
    let mut digest = sha256_hex(format!("{parent}\n{predicate}").as_bytes());
    digest.truncate(16);
    digest
}

/// Select episodes of the main partition and materialise the slice.
pub fn slice_dataset(request: &SliceRequest<'_>) -> Result<SliceManifest> {
    let source = request.source;
    if source.canonicalize().ok() == request.output.canonicalize().ok() && request.output.exists() {
        bail!("slice output must differ from the source dataset");
    }
    let mut reader = DatasetReader::open(DatasetLayout::new(source), Partition::Main)?;
    let index = EpisodeIndex::build(reader.records().to_vec())?;
    let selected: Vec<EpisodeIndexRecord> = index
        .query_records(request.predicate)
        .into_iter()
        .cloned()
        .collect();
    let parent_build_id = reader.info().provenance.build_id.to_string();
    let slice_id = request
        .slice_id
        .clone()
        .unwrap_or_else(|| derived_id(&parent_build_id, request.predicate));

    std::fs::create_dir_all(request.output)
        .with_context(|| format!("Failed to create {}", request.output.display()))?;

    if request.mode == SliceMode::Copy {
        let layout = DatasetLayout::new(request.output);
        let spec = reader.spec()?;
        let mut writer = ShardWriter::new(layout.clone(), spec.clone(), request.limits);
        for record in &selected {
            let episode = reader.read_episode(record)?;
            writer.write(episode, Partition::Main, &record.split, Vec::new())?;
        }
        let written = writer.finish()?;

        let mut provenance = reader.info().provenance.clone();
        provenance.build_id = BuildId::new(derived_id(&parent_build_id, request.predicate));
        provenance.build_timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut params = serde_json::Map::new();
        params.insert("predicate".into(), request.predicate.to_string().into());
        params.insert("parent_build_id".into(), parent_build_id.clone().into());
        provenance.transform_pipeline.push(TransformStep {
            name: "slice".into(),
            params,
        });
        finalize_dataset(&FinalizeInput {
            layout: &layout,
            spec: &spec,
            written: &written,
            provenance: &provenance,
        })?;
    }

    let manifest = SliceManifest {
        slice_id,
        mode: request.mode,
        parent_dataset: source.canonicalize().unwrap_or_else(|_| source.to_path_buf()),
        parent_build_id,
        predicate: request.predicate.to_string(),
        episode_ids: selected.into_iter().map(|r| r.episode_id).collect(),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    write_json(&request.output.join(SLICE_MANIFEST_FILE), &manifest)?;
    tracing::info!(
        slice_id = manifest.slice_id,
        mode = %manifest.mode,
        episodes = manifest.episode_ids.len(),
        "Slice written"
    );
    Ok(manifest)
}

/// A resolved `view` slice.
#[derive(Debug, Clone)]
pub struct SliceView {
    pub manifest: SliceManifest,
    pub layout: DatasetLayout,
    /// Only the selected records, in the order the view lists them.
    pub index: EpisodeIndex,
}

/// Open a view slice, checking it still matches its parent build.
pub fn load_view(dir: &Path) -> Result<SliceView> {
    let path = dir.join(SLICE_MANIFEST_FILE);
    let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest: SliceManifest =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
    if manifest.mode != SliceMode::View {
        bail!("{} describes a {} slice, not a view", path.display(), manifest.mode);
    }
    let layout = DatasetLayout::new(&manifest.parent_dataset);
    let info = read_info(&layout, Partition::Main)?;
    if info.provenance.build_id.as_str() != manifest.parent_build_id {
        bail!(
            "view '{}' is stale: parent dataset build id is {}, view was taken from {}",
            manifest.slice_id,
            info.provenance.build_id,
            manifest.parent_build_id
        );
    }
    let parent = EpisodeIndex::load(&layout, Partition::Main)?;
    let mut records = Vec::with_capacity(manifest.episode_ids.len());
    for id in &manifest.episode_ids {
        let Some(record) = parent.get(id) else {
            bail!("view '{}' references missing episode '{id}'", manifest.slice_id);
        };
        records.push(record.clone());
    }
    Ok(SliceView {
        index: EpisodeIndex::build(records)?,
        manifest,
        layout,
    })
}
