//! Shard writer: the single owner of shard files, row cursors, running
//! statistics and the task catalog.
//!
//! Episodes accumulate in one open shard per partition. A shard is flushed
//! once it reaches the episode or frame threshold. Flushing stages every
//! file under a `.tmp` name and fsyncs it, renames the index batch, data
//! file and video files into place, and then records the shard, the
//! dispositions it carries and a writer snapshot in one checkpoint
//! transaction. Files of a shard that never reached the checkpoint are
//! orphans and are removed on resume.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use datakit_state::backend::CheckpointStore;
use datakit_types::episode::Episode;
use datakit_types::finding::ValidationFinding;
use datakit_types::index::{DataShardRef, EpisodeIndexRecord, VideoShardRef};
use datakit_types::manifest::{ShardEntry, ShardEpisode, VideoShardEntry};
use datakit_types::provenance::BuildId;
use datakit_types::spec::{DatasetSpec, FeatureSpec};
use datakit_types::state::{Checkpoint, CheckpointCommit, DisposedEpisode, Disposition, Partition};
use datakit_types::tasks::TaskCatalog;
use datakit_types::tensor::Tensor;
use serde::{Deserialize, Serialize};

use super::codec::{encode_steps, ACTION_COLUMN};
use super::index_file::encode_records;
use super::layout::{tmp_path, DatasetLayout};
use super::parquet::{batch_to_parquet, promote, sha256_hex, write_durable};
use super::stats::StatsAccumulator;
use super::video::{is_video_frame, FrameEncoder, RawFrameCodec, VideoCodec};

/// Shard size thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLimits {
    pub episodes_per_shard: usize,
    pub frames_per_shard: u64,
}

/// Committed progress of one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionCursor {
    pub next_shard_id: u32,
    pub next_row: u64,
    pub episodes: u64,
    pub stats: StatsAccumulator,
}

/// Writer state persisted with every checkpoint commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterSnapshot {
    pub catalog: TaskCatalog,
    pub features: BTreeMap<String, FeatureSpec>,
    pub main: PartitionCursor,
    pub quarantine: PartitionCursor,
}

impl WriterSnapshot {
    fn cursor(&self, partition: Partition) -> &PartitionCursor {
        match partition {
            Partition::Main => &self.main,
            Partition::Quarantine => &self.quarantine,
        }
    }

    fn cursor_mut(&mut self, partition: Partition) -> &mut PartitionCursor {
        match partition {
            Partition::Main => &mut self.main,
            Partition::Quarantine => &mut self.quarantine,
        }
    }
}

/// Widen `features` to cover `tensor` under `key`: the dtype widens the
/// way the data columns do, and dimensions that disagree become wildcards.
fn register_feature(features: &mut BTreeMap<String, FeatureSpec>, key: &str, tensor: &Tensor, video: bool) {
    match features.get_mut(key) {
        None => {
            let mut spec = FeatureSpec::new(tensor.dtype(), &tensor.shape);
            spec.is_video = video;
            features.insert(key.to_string(), spec);
        }
        Some(spec) if spec.shape.len() != tensor.shape.len() => {
            spec.dtype = spec.dtype.widen(tensor.dtype());
            spec.shape = vec![None; spec.shape.len().max(tensor.shape.len())];
        }
        Some(spec) => {
            spec.dtype = spec.dtype.widen(tensor.dtype());
            for (declared, actual) in spec.shape.iter_mut().zip(&tensor.shape) {
                if *declared != Some(*actual) {
                    *declared = None;
                }
            }
        }
    }
}

/// Checkpoint destination for shard commits.
#[derive(Clone)]
pub struct CheckpointSink {
    pub store: Arc<dyn CheckpointStore>,
    pub build: BuildId,
}

struct OpenShard {
    shard_id: u32,
    row_start: u64,
    rows: u64,
    episodes: Vec<Episode>,
    records: Vec<EpisodeIndexRecord>,
    placements: Vec<ShardEpisode>,
    videos: BTreeMap<String, Box<dyn FrameEncoder>>,
    stats: StatsAccumulator,
    disposed: Vec<DisposedEpisode>,
}

impl OpenShard {
    fn new(cursor: &PartitionCursor) -> Self {
        Self {
            shard_id: cursor.next_shard_id,
            row_start: cursor.next_row,
            rows: 0,
            episodes: Vec::new(),
            records: Vec::new(),
            placements: Vec::new(),
            videos: BTreeMap::new(),
            stats: StatsAccumulator::default(),
            disposed: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Everything the finaliser needs once writing is done.
#[derive(Debug, Clone)]
pub struct WrittenDataset {
    pub shards: Vec<ShardEntry>,
    pub snapshot: WriterSnapshot,
    pub video_codec: &'static str,
    pub video_extension: &'static str,
}

pub struct ShardWriter {
    layout: DatasetLayout,
    spec: DatasetSpec,
    limits: ShardLimits,
    codec: Arc<dyn VideoCodec>,
    checkpoint: Option<CheckpointSink>,
    snapshot: WriterSnapshot,
    shards: Vec<ShardEntry>,
    main: Option<OpenShard>,
    quarantine: Option<OpenShard>,
    pending_rejects: Vec<DisposedEpisode>,
}

impl ShardWriter {
    /// A writer for an empty output directory.
    #[must_use]
    pub fn new(layout: DatasetLayout, spec: DatasetSpec, limits: ShardLimits) -> Self {
        let snapshot = WriterSnapshot {
            catalog: spec.task_catalog.clone(),
            ..WriterSnapshot::default()
        };
        Self {
            layout,
            spec,
            limits,
            codec: Arc::new(RawFrameCodec),
            checkpoint: None,
            snapshot,
            shards: Vec::new(),
            main: None,
            quarantine: None,
            pending_rejects: Vec::new(),
        }
    }

    /// A writer continuing from a committed checkpoint.
    pub fn resume(
        layout: DatasetLayout,
        spec: DatasetSpec,
        limits: ShardLimits,
        checkpoint: &Checkpoint,
    ) -> Result<Self> {
        let mut writer = Self::new(layout, spec, limits);
        if let Some(state) = &checkpoint.writer_state {
            writer.snapshot =
                serde_json::from_str(state).context("Failed to decode writer snapshot from checkpoint")?;
        }
        writer.shards.clone_from(&checkpoint.shards);
        Ok(writer)
    }

    #[must_use]
    pub fn with_checkpoint(mut self, sink: CheckpointSink) -> Self {
        self.checkpoint = Some(sink);
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn VideoCodec>) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn snapshot(&self) -> &WriterSnapshot {
        &self.snapshot
    }

    #[must_use]
    pub fn committed_shards(&self) -> &[ShardEntry] {
        &self.shards
    }

    fn open_shard(&mut self, partition: Partition) -> &mut OpenShard {
        let cursor = self.snapshot.cursor(partition).clone();
        let slot = match partition {
            Partition::Main => &mut self.main,
            Partition::Quarantine => &mut self.quarantine,
        };
        slot.get_or_insert_with(|| OpenShard::new(&cursor))
    }

    /// Append one episode to the open shard of `partition`, flushing the
    /// shard when it reaches a threshold.
    pub fn write(
        &mut self,
        mut episode: Episode,
        partition: Partition,
        split: &str,
        findings: Vec<ValidationFinding>,
    ) -> Result<EpisodeIndexRecord> {
        let task_id = self.snapshot.catalog.get_or_insert(&episode.task_text);
        episode.task_id = Some(task_id);

        let video_keys: Vec<String> = episode
            .steps
            .first()
            .map(|first| {
                first
                    .observation
                    .keys()
                    .filter(|key| {
                        episode
                            .steps
                            .iter()
                            .all(|s| s.observation.get(*key).is_some_and(is_video_frame))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for step in &episode.steps {
            if let Some(action) = &step.action {
                register_feature(&mut self.snapshot.features, ACTION_COLUMN, action, false);
            }
            for (key, tensor) in &step.observation {
                register_feature(&mut self.snapshot.features, key, tensor, video_keys.contains(key));
            }
        }

        let codec = Arc::clone(&self.codec);
        let limits = self.limits;
        let action_space = self.spec.action_space_type.as_str().to_string();
        let source_uri = self.spec.source_uri.clone();
        let shard = self.open_shard(partition);

        let num_steps = episode.num_steps() as u64;
        let camera_set = episode.cameras().join(",");
        let row_start = shard.row_start + shard.rows;
        shard
            .stats
            .observe(&episode, |key| video_keys.iter().any(|k| k == key));

        let mut videos = Vec::with_capacity(video_keys.len());
        for key in &video_keys {
            let encoder = shard
                .videos
                .entry(key.clone())
                .or_insert_with(|| codec.encoder());
            let frame_start = encoder.frame_count();
            for step in &mut episode.steps {
                if let Some(frame) = step.observation.remove(key) {
                    encoder
                        .push_frame(&frame)
                        .with_context(|| format!("Failed to encode frame of '{key}'"))?;
                }
            }
            videos.push(VideoShardRef {
                key: key.clone(),
                shard_id: shard.shard_id,
                frame_start,
                frame_count: encoder.frame_count() - frame_start,
            });
        }

        let record = EpisodeIndexRecord {
            episode_id: episode.episode_id.clone(),
            dataset_id: episode.dataset_id.clone(),
            source_episode_index: episode.source_episode_index,
            invalid: episode.invalid,
            num_steps,
            task_id,
            task_text: episode.task_text.clone(),
            robot_id: episode.metadata_str("robot_id").unwrap_or_default().to_string(),
            split: split.to_string(),
            duration_secs: episode.duration_secs(),
            camera_set,
            action_space_type: action_space,
            source_uri,
            data: DataShardRef {
                shard_id: shard.shard_id,
                row_start,
                row_count: num_steps,
            },
            videos,
            episode_metadata: episode.episode_metadata.clone(),
        };

        shard.placements.push(ShardEpisode {
            episode_id: episode.episode_id.clone(),
            start: row_start,
            length: num_steps,
        });
        shard.disposed.push(DisposedEpisode {
            episode_id: episode.episode_id.clone(),
            disposition: match partition {
                Partition::Main => Disposition::Accepted,
                Partition::Quarantine => Disposition::Quarantined,
            },
            findings,
        });
        shard.rows += num_steps;
        shard.records.push(record.clone());
        shard.episodes.push(episode);

        let full = shard.records.len() >= limits.episodes_per_shard
            || shard.rows >= limits.frames_per_shard;
        tracing::debug!(
            episode_id = record.episode_id,
            partition = %partition,
            shard_id = record.data.shard_id,
            row_start = record.data.row_start,
            "Episode staged"
        );
        if full {
            self.flush(partition)?;
        }
        Ok(record)
    }

    /// Remember a rejected episode; it is checkpointed with the next commit.
    pub fn record_rejected(&mut self, episode_id: String, findings: Vec<ValidationFinding>) {
        self.pending_rejects.push(DisposedEpisode {
            episode_id,
            disposition: Disposition::Rejected,
            findings,
        });
    }

    /// Commit the open shard of `partition`, if it holds anything.
    pub fn flush(&mut self, partition: Partition) -> Result<Option<ShardEntry>> {
        let slot = match partition {
            Partition::Main => self.main.take(),
            Partition::Quarantine => self.quarantine.take(),
        };
        let Some(shard) = slot.filter(|s| !s.is_empty()) else {
            return Ok(None);
        };

        let data_rel = DatasetLayout::data_rel(partition, shard.shard_id);
        let index_rel = DatasetLayout::index_rel(partition, shard.shard_id);
        let data_path = self.layout.resolve(&data_rel);
        let index_path = self.layout.resolve(&index_rel);

        let data_bytes = batch_to_parquet(&encode_steps(&shard.episodes, shard.row_start)?)?;
        write_durable(&tmp_path(&data_path), &data_bytes)?;

        let mut staged_videos = Vec::with_capacity(shard.videos.len());
        let mut video_entries = Vec::with_capacity(shard.videos.len());
        for (key, encoder) in shard.videos {
            let num_frames = encoder.frame_count();
            let bytes = encoder
                .finish()
                .with_context(|| format!("Failed to finish video shard for '{key}'"))?;
            let rel = DatasetLayout::video_rel(partition, &key, shard.shard_id, self.codec.extension());
            let path = self.layout.resolve(&rel);
            write_durable(&tmp_path(&path), &bytes)?;
            video_entries.push(VideoShardEntry {
                key,
                path: rel,
                num_frames,
                checksum: sha256_hex(&bytes),
            });
            staged_videos.push(path);
        }

        let index_bytes = batch_to_parquet(&encode_records(&shard.records)?)?;
        write_durable(&tmp_path(&index_path), &index_bytes)?;

        // A crash between the renames below and the checkpoint commit leaves
        // shard files no checkpoint references; resume deletes them.
        promote(&tmp_path(&index_path), &index_path)?;
        promote(&tmp_path(&data_path), &data_path)?;
        for path in &staged_videos {
            promote(&tmp_path(path), path)?;
        }

        let entry = ShardEntry {
            shard_id: shard.shard_id,
            partition,
            path: data_rel,
            index_path: index_rel,
            row_start: shard.row_start,
            row_end: shard.row_start + shard.rows,
            episodes: shard.placements,
            checksum: sha256_hex(&data_bytes),
            videos: video_entries,
        };

        let cursor = self.snapshot.cursor_mut(partition);
        cursor.next_shard_id = shard.shard_id + 1;
        cursor.next_row = entry.row_end;
        cursor.episodes += entry.episodes.len() as u64;
        cursor.stats.merge(&shard.stats);

        let mut disposed = shard.disposed;
        disposed.append(&mut self.pending_rejects);
        self.commit_checkpoint(Some(entry.clone()), disposed)?;

        tracing::info!(
            partition = %partition,
            shard_id = entry.shard_id,
            episodes = entry.episodes.len(),
            rows = entry.num_rows(),
            "Shard committed"
        );
        self.shards.push(entry.clone());
        Ok(Some(entry))
    }

    fn commit_checkpoint(&mut self, shard: Option<ShardEntry>, disposed: Vec<DisposedEpisode>) -> Result<()> {
        let Some(sink) = &self.checkpoint else {
            return Ok(());
        };
        if shard.is_none() && disposed.is_empty() {
            return Ok(());
        }
        let commit = CheckpointCommit {
            shard,
            disposed,
            writer_state: serde_json::to_string(&self.snapshot).context("Failed to encode writer snapshot")?,
        };
        sink.store
            .commit(&sink.build, &commit)
            .context("Failed to commit checkpoint")
    }

    /// Flush both partitions and checkpoint any remaining rejections.
    pub fn finish(mut self) -> Result<WrittenDataset> {
        self.flush(Partition::Main)?;
        self.flush(Partition::Quarantine)?;
        let rejects = std::mem::take(&mut self.pending_rejects);
        self.commit_checkpoint(None, rejects)?;
        Ok(WrittenDataset {
            shards: self.shards,
            snapshot: self.snapshot,
            video_codec: self.codec.name(),
            video_extension: self.codec.extension(),
        })
    }

    /// Drop the open shards without writing them. Rejections already made
    /// are still checkpointed so a resumed run does not revisit them.
    pub fn abort(mut self) -> Result<()> {
        for shard in [self.main.take(), self.quarantine.take()].into_iter().flatten() {
            tracing::warn!(
                shard_id = shard.shard_id,
                episodes = shard.records.len(),
                "Discarding uncommitted shard"
            );
        }
        let rejects = std::mem::take(&mut self.pending_rejects);
        self.commit_checkpoint(None, rejects)
    }
}
