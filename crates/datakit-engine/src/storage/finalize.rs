//! Dataset finalisation: metadata files, manifest, checksums and the card.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{bail, Context, Result};
use datakit_types::index::EpisodeIndexRecord;
use datakit_types::manifest::ShardManifest;
use datakit_types::provenance::BuildProvenance;
use datakit_types::spec::{ActionSpaceType, DatasetSpec, FeatureSpec};
use datakit_types::state::Partition;
use datakit_types::tasks::TaskCatalog;
use serde::{Deserialize, Serialize};

use super::codec::ACTION_COLUMN;
use super::index_file::read_index;
use super::layout::{
    DatasetLayout, CHECKPOINT_DIR, CHECKSUMS_FILE, DATA_PATH_TEMPLATE, INFO_FILE, MANIFEST_FILE,
    README_FILE, REPORTS_DIR, STATS_FILE, TASKS_FILE, TMP_SUFFIX, VIDEO_PATH_TEMPLATE,
};
use super::parquet::{sha256_file, write_durable};
use super::stats::FeatureSummary;
use super::writer::{PartitionCursor, WrittenDataset};

pub const FORMAT_VERSION: &str = "datakit/1";

/// Contents of `meta/info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub format_version: String,
    pub dataset_id: String,
    pub dataset_name: String,
    pub partition: Partition,
    pub fps: f64,
    pub action_space_type: ActionSpaceType,
    pub camera_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_camera: Option<String>,
    pub total_episodes: u64,
    pub total_frames: u64,
    pub total_shards: u64,
    pub total_tasks: u64,
    pub invalid_episodes: u64,
    pub splits: BTreeMap<String, u64>,
    pub data_path: String,
    pub video_path: String,
    pub video_codec: String,
    pub video_extension: String,
    pub features: BTreeMap<String, FeatureSpec>,
    pub provenance: BuildProvenance,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_metadata: BTreeMap<String, serde_json::Value>,
}

impl DatasetInfo {
    /// The dataset spec a reader sees: schema from the written features.
    #[must_use]
    pub fn to_spec(&self) -> DatasetSpec {
        let mut spec = DatasetSpec::new(&self.dataset_id, &self.dataset_name);
        spec.observation_schema = self
            .features
            .iter()
            .filter(|(key, _)| key.as_str() != ACTION_COLUMN)
            .map(|(key, feature)| (key.clone(), feature.clone()))
            .collect();
        spec.action_schema = self.features.get(ACTION_COLUMN).cloned();
        spec.control_rate_hz = self.fps;
        spec.action_space_type = self.action_space_type;
        spec.camera_names.clone_from(&self.camera_names);
        spec.canonical_camera.clone_from(&self.canonical_camera);
        spec.source_uri.clone_from(&self.provenance.source_uri);
        spec.build_id = self.provenance.build_id.to_string();
        spec.transform_pipeline = self
            .provenance
            .transform_pipeline
            .iter()
            .map(|t| t.name.clone())
            .collect();
        spec.extra_metadata.clone_from(&self.extra_metadata);
        spec
    }
}

/// `datakit/<major>[.<minor>]` to its major component.
fn format_major(version: &str) -> Option<&str> {
    let (name, number) = version.split_once('/')?;
    if name != "datakit" {
        return None;
    }
    number.split('.').next().filter(|major| !major.is_empty())
}

/// Read `info.json` of `partition`. Fails on a format major version this
/// build cannot read.
pub fn read_info(layout: &DatasetLayout, partition: Partition) -> Result<DatasetInfo> {
    let path = layout.partition_file(partition, INFO_FILE);
    let info: DatasetInfo = read_json(&path)?;
    if format_major(&info.format_version) != format_major(FORMAT_VERSION) {
        bail!(
            "{} has unsupported format version '{}' (this build reads {FORMAT_VERSION})",
            path.display(),
            info.format_version
        );
    }
    Ok(info)
}

pub fn read_manifest(layout: &DatasetLayout) -> Result<ShardManifest> {
    read_json(&layout.resolve(MANIFEST_FILE))
}

pub fn read_stats(layout: &DatasetLayout, partition: Partition) -> Result<BTreeMap<String, FeatureSummary>> {
    read_json(&layout.partition_file(partition, STATS_FILE))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).context("Failed to encode JSON")?;
    bytes.push(b'\n');
    write_durable(path, &bytes)
}

fn write_tasks(path: &Path, catalog: &TaskCatalog) -> Result<()> {
    let mut out = String::new();
    for entry in catalog.entries() {
        out.push_str(&serde_json::to_string(&entry).context("Failed to encode task entry")?);
        out.push('\n');
    }
    write_durable(path, out.as_bytes())
}

/// Inputs to [`finalize_dataset`].
pub struct FinalizeInput<'a> {
    pub layout: &'a DatasetLayout,
    pub spec: &'a DatasetSpec,
    pub written: &'a WrittenDataset,
    pub provenance: &'a BuildProvenance,
}

/// What was finalised, per partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalizeSummary {
    pub main_episodes: u64,
    pub quarantine_episodes: u64,
    pub checksummed_files: usize,
}

fn partition_info(
    input: &FinalizeInput<'_>,
    partition: Partition,
    records: &[EpisodeIndexRecord],
) -> DatasetInfo {
    let mut splits = BTreeMap::new();
    for record in records {
        *splits.entry(record.split.clone()).or_insert(0) += 1;
    }
    let spec = input.spec;
    DatasetInfo {
        format_version: FORMAT_VERSION.to_string(),
        dataset_id: spec.dataset_id.clone(),
        dataset_name: spec.dataset_name.clone(),
        partition,
        fps: spec.control_rate_hz,
        action_space_type: spec.action_space_type,
        camera_names: spec.camera_names.clone(),
        canonical_camera: spec.canonical_camera.clone(),
        total_episodes: records.len() as u64,
        total_frames: records.iter().map(|r| r.num_steps).sum(),
        total_shards: input
            .written
            .shards
            .iter()
            .filter(|s| s.partition == partition)
            .count() as u64,
        total_tasks: input.written.snapshot.catalog.len() as u64,
        invalid_episodes: records.iter().filter(|r| r.invalid).count() as u64,
        splits,
        data_path: DatasetLayout::relative(partition, DATA_PATH_TEMPLATE),
        video_path: DatasetLayout::relative(partition, VIDEO_PATH_TEMPLATE),
        video_codec: input.written.video_codec.to_string(),
        video_extension: input.written.video_extension.to_string(),
        features: input.written.snapshot.features.clone(),
        provenance: input.provenance.clone(),
        extra_metadata: spec.extra_metadata.clone(),
    }
}

fn write_partition(
    input: &FinalizeInput<'_>,
    manifest: &ShardManifest,
    partition: Partition,
    cursor: &PartitionCursor,
) -> Result<u64> {
    let layout = input.layout;
    let records = read_index(layout, manifest.partition(partition))?;
    let info = partition_info(input, partition, &records);
    write_json(&layout.partition_file(partition, INFO_FILE), &info)?;
    write_tasks(&layout.partition_file(partition, TASKS_FILE), &input.written.snapshot.catalog)?;
    write_json(&layout.partition_file(partition, STATS_FILE), &cursor.stats.summary())?;
    Ok(info.total_episodes)
}

/// Write every completion artefact. Fails if any two episodes overlap in
/// a shard.
pub fn finalize_dataset(input: &FinalizeInput<'_>) -> Result<FinalizeSummary> {
    let manifest = ShardManifest {
        build_id: input.provenance.build_id.to_string(),
        shards: input.written.shards.clone(),
    };
    let problems = manifest.overlap_problems();
    if !problems.is_empty() {
        bail!("Shard offset verification failed:\n  - {}", problems.join("\n  - "));
    }

    let snapshot = &input.written.snapshot;
    let main_episodes = write_partition(input, &manifest, Partition::Main, &snapshot.main)?;
    let quarantine_episodes = if manifest.partition(Partition::Quarantine).next().is_some() {
        write_partition(input, &manifest, Partition::Quarantine, &snapshot.quarantine)?
    } else {
        0
    };

    write_json(&input.layout.resolve(MANIFEST_FILE), &manifest)?;
    write_durable(
        &input.layout.resolve(README_FILE),
        dataset_card(input, main_episodes, quarantine_episodes).as_bytes(),
    )?;
    let checksums = compute_checksums(input.layout.root())?;
    write_json(&input.layout.resolve(CHECKSUMS_FILE), &checksums)?;

    tracing::info!(
        build_id = %input.provenance.build_id,
        main_episodes,
        quarantine_episodes,
        shards = manifest.shards.len(),
        "Dataset finalised"
    );
    Ok(FinalizeSummary {
        main_episodes,
        quarantine_episodes,
        checksummed_files: checksums.len(),
    })
}

fn dataset_card(input: &FinalizeInput<'_>, main_episodes: u64, quarantine_episodes: u64) -> String {
    let spec = input.spec;
    let prov = input.provenance;
    let mut card = String::new();
    let _ = writeln!(card, "# {}\n", spec.dataset_name);
    let _ = writeln!(card, "- dataset id: `{}`", spec.dataset_id);
    let _ = writeln!(card, "- build id: `{}`", prov.build_id);
    let _ = writeln!(card, "- built: {}", prov.build_timestamp);
    let _ = writeln!(card, "- source: `{}` (version `{}`)", prov.source_uri, prov.source_version);
    let _ = writeln!(card, "- control rate: {} Hz", spec.control_rate_hz);
    let _ = writeln!(card, "- action space: `{}`", spec.action_space_type);
    let _ = writeln!(card, "- episodes: {main_episodes} ({quarantine_episodes} quarantined)");
    let _ = writeln!(card, "- tasks: {}", input.written.snapshot.catalog.len());
    let _ = writeln!(card, "- seed: {}\n", prov.random_seed);
    let _ = writeln!(card, "## Transform pipeline\n");
    if prov.transform_pipeline.is_empty() {
        let _ = writeln!(card, "_none_");
    }
    for (i, step) in prov.transform_pipeline.iter().enumerate() {
        let params = serde_json::to_string(&step.params).unwrap_or_default();
        let _ = writeln!(card, "{}. `{}` {params}", i + 1, step.name);
    }
    let _ = writeln!(card, "\n## Features\n");
    for (key, feature) in &input.written.snapshot.features {
        let shape: Vec<String> = feature
            .shape
            .iter()
            .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
            .collect();
        let kind = if feature.is_video { " (video)" } else { "" };
        let _ = writeln!(card, "- `{key}`: {} [{}]{kind}", feature.dtype, shape.join(", "));
    }
    card
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?;
    for entry in entries {
        let path = entry.with_context(|| format!("Failed to list {}", dir.display()))?.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel == CHECKPOINT_DIR || rel == REPORTS_DIR || rel == CHECKSUMS_FILE || rel.ends_with(TMP_SUFFIX) {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            out.insert(rel, sha256_file(&path)?);
        }
    }
    Ok(())
}

/// Sha256 of every dataset file, keyed by root-relative path.
pub fn compute_checksums(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    collect_files(root, root, &mut out)?;
    Ok(out)
}

/// Files whose current checksum differs from `meta/checksums.json`.
pub fn verify_checksums(layout: &DatasetLayout) -> Result<Vec<String>> {
    let recorded: BTreeMap<String, String> = read_json(&layout.resolve(CHECKSUMS_FILE))?;
    let current = compute_checksums(layout.root())?;
    let mut mismatched: Vec<String> = recorded
        .iter()
        .filter(|(path, sum)| current.get(*path) != Some(*sum))
        .map(|(path, _)| path.clone())
        .collect();
    mismatched.extend(current.keys().filter(|p| !recorded.contains_key(*p)).cloned());
    Ok(mismatched)
}

#[cfg(test)]
mod tests {
    use datakit_types::episode::{Episode, Step};
    use datakit_types::provenance::BuildId;
    use datakit_types::tensor::Tensor;

    use super::*;
    use crate::storage::writer::{ShardLimits, ShardWriter};

    fn provenance() -> BuildProvenance {
        BuildProvenance {
            build_id: BuildId::new("abc123"),
            build_timestamp: "2026-01-01T00:00:00Z".into(),
            random_seed: 42,
            transform_pipeline: Vec::new(),
            source_uri: "/src".into(),
            source_version: "1".into(),
            code_version: "0.1.0".into(),
        }
    }

    fn episode(id: &str, n: usize) -> Episode {
        let mut ep = Episode::new(id, "ds");
        ep.task_text = "push".into();
        for i in 0..n {
            let mut step = Step::new(false, false, f64::from(u32::try_from(i).unwrap()));
            step.action = Some(Tensor::vector_f32(vec![1.0, 2.0]));
            ep.steps.push(step);
        }
        ep.mark_boundaries();
        ep
    }

    fn build(dir: &Path, quarantine: bool) -> (DatasetLayout, DatasetSpec, WrittenDataset) {
        let layout = DatasetLayout::new(dir);
        let spec = DatasetSpec::new("ds", "Demo");
        let mut writer = ShardWriter::new(
            layout.clone(),
            spec.clone(),
            ShardLimits { episodes_per_shard: 2, frames_per_shard: 100 },
        );
        writer.write(episode("a", 3), Partition::Main, "train", vec![]).unwrap();
        writer.write(episode("b", 2), Partition::Main, "val", vec![]).unwrap();
        writer.write(episode("c", 1), Partition::Main, "train", vec![]).unwrap();
        if quarantine {
            writer.write(episode("q", 2), Partition::Quarantine, "train", vec![]).unwrap();
        }
        (layout, spec, writer.finish().unwrap())
    }

    #[test]
    fn test_finalize_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, spec, written) = build(dir.path(), true);
        let prov = provenance();
        let summary = finalize_dataset(&FinalizeInput {
            layout: &layout,
            spec: &spec,
            written: &written,
            provenance: &prov,
        })
        .unwrap();
        assert_eq!(summary.main_episodes, 3);
        assert_eq!(summary.quarantine_episodes, 1);

        let info = read_info(&layout, Partition::Main).unwrap();
        assert_eq!(info.total_frames, 6);
        assert_eq!(info.total_shards, 2);
        assert_eq!(info.splits["train"], 2);
        assert_eq!(info.provenance.build_id.as_str(), "abc123");
        assert_eq!(info.to_spec().action_schema.unwrap().shape, vec![Some(2)]);

        let tasks = std::fs::read_to_string(dir.path().join("meta/tasks.jsonl")).unwrap();
        assert_eq!(tasks.trim(), r#"{"task_index":0,"task":"push"}"#);
        let stats = read_stats(&layout, Partition::Main).unwrap();
        assert_eq!(stats["action"].mean, vec![1.0, 2.0]);
        assert!(dir.path().join("quarantine/meta/info.json").exists());
        assert!(read_manifest(&layout).unwrap().shards.len() == 3);
        assert!(verify_checksums(&layout).unwrap().is_empty());
        let card = std::fs::read_to_string(dir.path().join("README.md")).unwrap();
        assert!(card.contains("abc123"));
    }

    #[test]
    fn test_tampering_detected() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, spec, written) = build(dir.path(), false);
        let prov = provenance();
        finalize_dataset(&FinalizeInput {
            layout: &layout,
            spec: &spec,
            written: &written,
            provenance: &prov,
        })
        .unwrap();
        assert!(!dir.path().join("quarantine").exists());
        std::fs::write(dir.path().join("meta/tasks.jsonl"), "{}\n").unwrap();
        assert_eq!(verify_checksums(&layout).unwrap(), vec!["meta/tasks.jsonl".to_string()]);
    }

    #[test]
    fn test_unknown_format_major_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, spec, written) = build(dir.path(), false);
        let prov = provenance();
        finalize_dataset(&FinalizeInput {
            layout: &layout,
            spec: &spec,
            written: &written,
            provenance: &prov,
        })
        .unwrap();
        let path = dir.path().join("meta/info.json");
        let set_version = |version: &str| {
            let mut info: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
            info["format_version"] = serde_json::json!(version);
            std::fs::write(&path, serde_json::to_vec(&info).unwrap()).unwrap();
        };

        set_version("datakit/1.4");
        assert!(read_info(&layout, Partition::Main).is_ok());
        set_version("datakit/2");
        let err = read_info(&layout, Partition::Main).unwrap_err();
        assert!(err.to_string().contains("unsupported format version 'datakit/2'"));
        set_version("lerobot/1");
        assert!(read_info(&layout, Partition::Main).is_err());
    }

    #[test]
    fn test_overlap_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, spec, mut written) = build(dir.path(), false);
        written.shards[0].episodes[1].start = 1;
        let prov = provenance();
        let err = finalize_dataset(&FinalizeInput {
            layout: &layout,
            spec: &spec,
            written: &written,
            provenance: &prov,
        })
        .unwrap_err();
        assert!(err.to_string().contains("offset verification"));
    }
}
