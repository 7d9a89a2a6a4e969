//! `meta/episodes/*.parquet`: one row per written episode.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, StringArray, UInt32Array, UInt64Array};
use arrow::record_batch::RecordBatch;
use datakit_types::index::{DataShardRef, EpisodeIndexRecord};
use datakit_types::manifest::ShardEntry;

use super::layout::DatasetLayout;
use super::parquet::{column, read_parquet};

fn strings<'a>(records: &'a [EpisodeIndexRecord], f: impl Fn(&'a EpisodeIndexRecord) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(f).collect::<Vec<_>>()))
}

fn u64s(records: &[EpisodeIndexRecord], f: impl Fn(&EpisodeIndexRecord) -> u64) -> ArrayRef {
    Arc::new(UInt64Array::from(records.iter().map(f).collect::<Vec<_>>()))
}

/// Encode index records as a batch.
pub fn encode_records(records: &[EpisodeIndexRecord]) -> Result<RecordBatch> {
    let videos = records
        .iter()
        .map(|r| serde_json::to_string(&r.videos))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to encode video references")?;
    let metadata = records
        .iter()
        .map(|r| {
            if r.episode_metadata.is_empty() {
                Ok(None)
            } else {
                serde_json::to_string(&r.episode_metadata).map(Some)
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to encode episode metadata")?;

    RecordBatch::try_from_iter(vec![
        ("episode_id", strings(records, |r| &r.episode_id)),
        ("dataset_id", strings(records, |r| &r.dataset_id)),
        ("source_episode_index", u64s(records, |r| r.source_episode_index)),
        (
            "invalid",
            Arc::new(BooleanArray::from(records.iter().map(|r| r.invalid).collect::<Vec<_>>())) as ArrayRef,
        ),
        ("num_steps", u64s(records, |r| r.num_steps)),
        (
            "task_id",
            Arc::new(UInt32Array::from(records.iter().map(|r| r.task_id).collect::<Vec<_>>())) as ArrayRef,
        ),
        ("task_text", strings(records, |r| &r.task_text)),
        ("robot_id", strings(records, |r| &r.robot_id)),
        ("split", strings(records, |r| &r.split)),
        (
            "duration_secs",
            Arc::new(Float64Array::from(records.iter().map(|r| r.duration_secs).collect::<Vec<_>>())) as ArrayRef,
        ),
        ("camera_set", strings(records, |r| &r.camera_set)),
        ("action_space_type", strings(records, |r| &r.action_space_type)),
        ("source_uri", strings(records, |r| &r.source_uri)),
        (
            "data_shard_id",
            Arc::new(UInt32Array::from(records.iter().map(|r| r.data.shard_id).collect::<Vec<_>>())) as ArrayRef,
        ),
        ("data_row_start", u64s(records, |r| r.data.row_start)),
        ("data_row_count", u64s(records, |r| r.data.row_count)),
        ("videos", Arc::new(StringArray::from(videos)) as ArrayRef),
        ("episode_metadata", Arc::new(StringArray::from(metadata)) as ArrayRef),
    ])
    .context("Failed to assemble episode index batch")
}

/// Decode every record of an index batch, in row order.
pub fn decode_records(batch: &RecordBatch) -> Result<Vec<EpisodeIndexRecord>> {
    let episode_id = column::<StringArray>(batch, "episode_id")?;
    let dataset_id = column::<StringArray>(batch, "dataset_id")?;
    let source_index = column::<UInt64Array>(batch, "source_episode_index")?;
    let invalid = column::<BooleanArray>(batch, "invalid")?;
    let num_steps = column::<UInt64Array>(batch, "num_steps")?;
    let task_id = column::<UInt32Array>(batch, "task_id")?;
    let task_text = column::<StringArray>(batch, "task_text")?;
    let robot_id = column::<StringArray>(batch, "robot_id")?;
    let split = column::<StringArray>(batch, "split")?;
    let duration = column::<Float64Array>(batch, "duration_secs")?;
    let camera_set = column::<StringArray>(batch, "camera_set")?;
    let action_space = column::<StringArray>(batch, "action_space_type")?;
    let source_uri = column::<StringArray>(batch, "source_uri")?;
    let shard_id = column::<UInt32Array>(batch, "data_shard_id")?;
    let row_start = column::<UInt64Array>(batch, "data_row_start")?;
    let row_count = column::<UInt64Array>(batch, "data_row_count")?;
    let videos = column::<StringArray>(batch, "videos")?;
    let metadata = column::<StringArray>(batch, "episode_metadata")?;

    (0..batch.num_rows())
        .map(|i| {
            let id = episode_id.value(i).to_string();
            let episode_metadata = if metadata.is_null(i) {
                Default::default()
            } else {
                serde_json::from_str(metadata.value(i))
                    .with_context(|| format!("Bad episode metadata for '{id}'"))?
            };
            Ok(EpisodeIndexRecord {
                dataset_id: dataset_id.value(i).to_string(),
                source_episode_index: source_index.value(i),
                invalid: invalid.value(i),
                num_steps: num_steps.value(i),
                task_id: task_id.value(i),
                task_text: task_text.value(i).to_string(),
                robot_id: robot_id.value(i).to_string(),
                split: split.value(i).to_string(),
                duration_secs: duration.value(i),
                camera_set: camera_set.value(i).to_string(),
                action_space_type: action_space.value(i).to_string(),
                source_uri: source_uri.value(i).to_string(),
                data: DataShardRef {
                    shard_id: shard_id.value(i),
                    row_start: row_start.value(i),
                    row_count: row_count.value(i),
                },
                videos: serde_json::from_str(videos.value(i))
                    .with_context(|| format!("Bad video references for '{id}'"))?,
                episode_metadata,
                episode_id: id,
            })
        })
        .collect()
}

/// Read the index batches of `shards`, in the order given.
pub fn read_index<'a>(
    layout: &DatasetLayout,
    shards: impl IntoIterator<Item = &'a ShardEntry>,
) -> Result<Vec<EpisodeIndexRecord>> {
    let mut records = Vec::new();
    for shard in shards {
        let path = layout.resolve(&shard.index_path);
        records.extend(read_index_file(&path)?);
    }
    Ok(records)
}

pub fn read_index_file(path: &Path) -> Result<Vec<EpisodeIndexRecord>> {
    let mut records = Vec::new();
    for batch in read_parquet(path)? {
        records.extend(
            decode_records(&batch).with_context(|| format!("Bad episode index {}", path.display()))?,
        );
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use datakit_types::index::VideoShardRef;
    use serde_json::json;

    use super::*;

    fn record(id: &str, steps: u64) -> EpisodeIndexRecord {
        EpisodeIndexRecord {
            episode_id: id.into(),
            dataset_id: "ds".into(),
            source_episode_index: 4,
            invalid: true,
            num_steps: steps,
            task_id: 2,
            task_text: "stack blocks".into(),
            robot_id: "franka".into(),
            split: "val".into(),
            duration_secs: 1.5,
            camera_set: "front,wrist".into(),
            action_space_type: "ee_delta_7".into(),
            source_uri: "/data/src".into(),
            data: DataShardRef { shard_id: 1, row_start: 30, row_count: steps },
            videos: vec![VideoShardRef {
                key: "observation.images.front".into(),
                shard_id: 1,
                frame_start: 0,
                frame_count: steps,
            }],
            episode_metadata: Default::default(),
        }
    }

    #[test]
    fn test_records_survive_encoding() {
        let mut second = record("b", 7);
        second.episode_metadata.insert("operator".into(), json!("kim"));
        let records = vec![record("a", 3), second];
        let batch = encode_records(&records).unwrap();
        assert_eq!(decode_records(&batch).unwrap(), records);
    }

    #[test]
    fn test_empty_batch() {
        let batch = encode_records(&[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert!(decode_records(&batch).unwrap().is_empty());
    }
}
