//! Reads compiled episodes back through the relational index.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arrow::record_batch::RecordBatch;
use datakit_types::episode::Episode;
use datakit_types::index::EpisodeIndexRecord;
use datakit_types::manifest::{ShardEntry, ShardManifest};
use datakit_types::spec::DatasetSpec;
use datakit_types::state::Partition;
use datakit_types::tasks::TaskEntry;

use super::codec::decode_steps;
use super::finalize::{read_info, read_manifest, DatasetInfo};
use super::index_file::read_index;
use super::layout::{DatasetLayout, TASKS_FILE};
use super::parquet::read_parquet_table;
use super::video::{RawFrameCodec, VideoCodec};

/// One partition of a finalised dataset.
pub struct DatasetReader {
    layout: DatasetLayout,
    partition: Partition,
    info: DatasetInfo,
    manifest: ShardManifest,
    records: Vec<EpisodeIndexRecord>,
    codec: Arc<dyn VideoCodec>,
    data_cache: HashMap<u32, RecordBatch>,
    video_cache: HashMap<String, Vec<u8>>,
}

impl std::fmt::Debug for DatasetReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetReader")
            .field("root", &self.layout.root())
            .field("partition", &self.partition)
            .field("episodes", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl DatasetReader {
    /// Open `partition` of the dataset rooted at `layout`.
    pub fn open(layout: DatasetLayout, partition: Partition) -> Result<Self> {
        let info = read_info(&layout, partition)?;
        let manifest = read_manifest(&layout)?;
        if manifest.build_id != info.provenance.build_id.as_str() {
            bail!(
                "manifest build id {} does not match info.json build id {}",
                manifest.build_id,
                info.provenance.build_id
            );
        }
        let records = read_index(&layout, manifest.partition(partition))?;
        let codec: Arc<dyn VideoCodec> = Arc::new(RawFrameCodec);
        if info.video_codec != codec.name() {
            bail!("unsupported video codec '{}'", info.video_codec);
        }
        Ok(Self {
            layout,
            partition,
            info,
            manifest,
            records,
            codec,
            data_cache: HashMap::new(),
            video_cache: HashMap::new(),
        })
    }

    #[must_use]
    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    #[must_use]
    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    #[must_use]
    pub fn manifest(&self) -> &ShardManifest {
        &self.manifest
    }

    /// Index records in commit order.
    #[must_use]
    pub fn records(&self) -> &[EpisodeIndexRecord] {
        &self.records
    }

    /// The dataset spec recorded at build time, task catalog included.
    pub fn spec(&self) -> Result<DatasetSpec> {
        let mut spec = self.info.to_spec();
        let path = self.layout.partition_file(self.partition, TASKS_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut tasks = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let entry: TaskEntry =
                serde_json::from_str(line).with_context(|| format!("Bad task entry in {}", path.display()))?;
            let index = usize::try_from(entry.task_index).context("task index out of range")?;
            if index != tasks.len() {
                bail!("task indices in {} are not contiguous", path.display());
            }
            tasks.push(entry.task);
        }
        spec.task_catalog = tasks.into();
        Ok(spec)
    }

    fn shard(&self, shard_id: u32) -> Result<&ShardEntry> {
        self.manifest
            .partition(self.partition)
            .find(|s| s.shard_id == shard_id)
            .ok_or_else(|| anyhow!("{} shard {shard_id} is not in the manifest", self.partition))
    }

    fn data_batch(&mut self, shard: &ShardEntry) -> Result<&RecordBatch> {
        if !self.data_cache.contains_key(&shard.shard_id) {
            let batch = read_parquet_table(&self.layout.resolve(&shard.path))?;
            self.data_cache.insert(shard.shard_id, batch);
        }
        self.data_cache
            .get(&shard.shard_id)
            .ok_or_else(|| anyhow!("data shard {} missing from cache", shard.shard_id))
    }

    fn video_bytes(&mut self, rel: &str) -> Result<&[u8]> {
        if !self.video_cache.contains_key(rel) {
            let path = self.layout.resolve(rel);
            let bytes = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            self.video_cache.insert(rel.to_string(), bytes);
        }
        self.video_cache
            .get(rel)
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow!("video shard {rel} missing from cache"))
    }

    /// Reconstruct the episode `record` points at, video frames included.
    pub fn read_episode(&mut self, record: &EpisodeIndexRecord) -> Result<Episode> {
        let shard = self.shard(record.data.shard_id)?.clone();
        if record.data.row_start < shard.row_start || record.data.row_end() > shard.row_end {
            bail!(
                "episode '{}' rows {}..{} fall outside shard {} ({}..{})",
                record.episode_id,
                record.data.row_start,
                record.data.row_end(),
                shard.shard_id,
                shard.row_start,
                shard.row_end
            );
        }
        let local = usize::try_from(record.data.row_start - shard.row_start)?;
        let count = usize::try_from(record.data.row_count)?;
        let batch = self.data_batch(&shard)?;
        let mut steps = decode_steps(batch, local..local + count, &record.episode_id)?;

        for video in &record.videos {
            let entry = shard
                .videos
                .iter()
                .find(|v| v.key == video.key)
                .ok_or_else(|| anyhow!("shard {} has no video for '{}'", shard.shard_id, video.key))?;
            let codec = Arc::clone(&self.codec);
            let bytes = self.video_bytes(&entry.path)?;
            let frames = codec
                .decoder()
                .decode_range(bytes, video.frame_start, video.frame_count)
                .with_context(|| format!("Failed to decode '{}' of '{}'", video.key, record.episode_id))?;
            if frames.len() != steps.len() {
                bail!(
                    "episode '{}' has {} steps but {} frames for '{}'",
                    record.episode_id,
                    steps.len(),
                    frames.len(),
                    video.key
                );
            }
            for (step, frame) in steps.iter_mut().zip(frames) {
                step.observation.insert(video.key.clone(), frame);
            }
        }

        Ok(Episode {
            episode_id: record.episode_id.clone(),
            dataset_id: record.dataset_id.clone(),
            source_episode_index: record.source_episode_index,
            steps,
            task_id: Some(record.task_id),
            task_text: record.task_text.clone(),
            invalid: record.invalid,
            episode_metadata: record.episode_metadata.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use datakit_types::episode::Step;
    use datakit_types::provenance::{BuildId, BuildProvenance};
    use datakit_types::tensor::Tensor;

    use super::*;
    use crate::storage::finalize::{finalize_dataset, FinalizeInput};
    use crate::storage::writer::{ShardLimits, ShardWriter};

    fn episode(id: &str, n: usize) -> Episode {
        let mut ep = Episode::new(id, "ds");
        ep.task_text = format!("task {id}");
        ep.episode_metadata.insert("robot_id".into(), serde_json::json!("arm"));
        for i in 0..n {
            let mut step = Step::new(false, false, f64::from(u32::try_from(i).unwrap()) * 0.1);
            step.action = Some(Tensor::vector_f32(vec![0.5; 3]));
            step.reward = Some(1.0);
            let pixel = u8::try_from(i).unwrap();
            step.observation.insert(
                "observation.images.front".into(),
                Tensor::image(2, 2, 3, vec![pixel; 12]).unwrap(),
            );
            step.observation
                .insert("observation.state".into(), Tensor::vector_f64(vec![f64::from(pixel)]));
            ep.steps.push(step);
        }
        ep.mark_boundaries();
        ep
    }

    fn compiled(dir: &std::path::Path, episodes: &[Episode]) -> DatasetLayout {
        let layout = DatasetLayout::new(dir);
        let spec = DatasetSpec::new("ds", "Demo");
        let mut writer = ShardWriter::new(
            layout.clone(),
            spec.clone(),
            ShardLimits { episodes_per_shard: 2, frames_per_shard: 1000 },
        );
        for ep in episodes {
            writer.write(ep.clone(), Partition::Main, "train", vec![]).unwrap();
        }
        let written = writer.finish().unwrap();
        let provenance = BuildProvenance {
            build_id: BuildId::new("b1"),
            build_timestamp: "2026-01-01T00:00:00Z".into(),
            random_seed: 0,
            transform_pipeline: Vec::new(),
            source_uri: String::new(),
            source_version: String::new(),
            code_version: "0".into(),
        };
        finalize_dataset(&FinalizeInput {
            layout: &layout,
            spec: &spec,
            written: &written,
            provenance: &provenance,
        })
        .unwrap();
        layout
    }

    #[test]
    fn test_episodes_read_back_intact() {
        let dir = tempfile::tempdir().unwrap();
        let originals = vec![episode("a", 3), episode("b", 4), episode("c", 2)];
        let layout = compiled(dir.path(), &originals);

        let mut reader = DatasetReader::open(layout, Partition::Main).unwrap();
        let records = reader.records().to_vec();
        assert_eq!(records.len(), 3);
        for (record, original) in records.iter().zip(&originals) {
            let ep = reader.read_episode(record).unwrap();
            assert_eq!(ep.steps, original.steps);
            assert_eq!(ep.task_text, original.task_text);
            assert_eq!(ep.episode_metadata, original.episode_metadata);
        }
        // The third episode lives in the second shard, starting at global row 7.
        assert_eq!(records[2].data.shard_id, 1);
        assert_eq!(records[2].data.row_start, 7);
    }

    #[test]
    fn test_spec_restores_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let layout = compiled(dir.path(), &[episode("a", 1), episode("b", 1)]);
        let reader = DatasetReader::open(layout, Partition::Main).unwrap();
        let spec = reader.spec().unwrap();
        assert_eq!(spec.task_catalog.task(1), Some("task b"));
        assert!(spec.observation_schema["observation.images.front"].is_video);
    }

    #[test]
    fn test_zero_step_episode_reads_back_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut empty = Episode::new("empty", "ds");
        empty.task_text = "task empty".into();
        let layout = compiled(dir.path(), &[empty]);

        let mut reader = DatasetReader::open(layout, Partition::Main).unwrap();
        let record = reader.records()[0].clone();
        assert_eq!(record.data.row_count, 0);
        let ep = reader.read_episode(&record).unwrap();
        assert_eq!(ep.episode_id, "empty");
        assert!(ep.steps.is_empty());
    }

    #[test]
    fn test_newer_format_refused_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let layout = compiled(dir.path(), &[episode("a", 1)]);
        let path = dir.path().join("meta/info.json");
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"datakit/1\"", "\"datakit/2\"")).unwrap();
        let err = DatasetReader::open(layout, Partition::Main).unwrap_err();
        assert!(format!("{err:#}").contains("datakit/2"));
    }

    #[test]
    fn test_record_outside_shard_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = compiled(dir.path(), &[episode("a", 2)]);
        let mut reader = DatasetReader::open(layout, Partition::Main).unwrap();
        let mut record = reader.records()[0].clone();
        record.data.row_count = 50;
        assert!(reader.read_episode(&record).is_err());
    }
}
