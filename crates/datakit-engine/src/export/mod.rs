//! Secondary export to RLDS-style TFRecord shards.
//!
//! Episodes are read back through the index (never re-transformed) and
//! written as one `tf.train.Example` per episode:
//!
//! - `episode_metadata/*`: identity, task, flags and the original
//!   `episode_metadata` as JSON.
//! - `steps/is_first`, `steps/is_last`, `steps/is_terminal`,
//!   `steps/timestamp`, `steps/reward`, `steps/discount`: one value per step.
//! - `steps/action` and every `steps/observation/...` tensor: values of all
//!   steps concatenated, with a companion `.../len` feature holding the
//!   element count of each step. Images are raw pixel bytes, one entry per
//!   step.
//! - `steps/step_metadata`: one JSON document per step.
//!
//! Anything that cannot be represented exactly is listed under
//! `provenance.losses` in `dataset_info.json`.

pub mod example;
pub mod tfrecord;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use datakit_types::episode::Episode;
use datakit_types::spec::FeatureSpec;
use datakit_types::state::Partition;
use datakit_types::tensor::{DType, Tensor, TensorData};
use prost::Message;
use serde::{Deserialize, Serialize};

use self::example::{Example, Feature};
use self::tfrecord::{TfRecordReader, TfRecordWriter};
use crate::index::Predicate;
use crate::provenance::CODE_VERSION;
use crate::storage::codec::{coerce, ACTION_COLUMN};
use crate::storage::finalize::write_json;
use crate::storage::video::is_video_frame;
use crate::storage::{DatasetLayout, DatasetReader};
use crate::transform::action::{ActionNormalization, NORMALIZE_ACTIONS};

pub const DATASET_INFO_FILE: &str = "dataset_info.json";
pub const EXPORT_FORMAT: &str = "rlds_tfrecord";
pub const DEFAULT_EPISODES_PER_FILE: usize = 100;

pub const EPISODE_ID_FEATURE: &str = "episode_metadata/episode_id";
pub const TASK_TEXT_FEATURE: &str = "episode_metadata/task_text";
pub const METADATA_JSON_FEATURE: &str = "episode_metadata/json";
pub const IS_FIRST_FEATURE: &str = "steps/is_first";
pub const IS_LAST_FEATURE: &str = "steps/is_last";
pub const IS_TERMINAL_FEATURE: &str = "steps/is_terminal";
pub const TIMESTAMP_FEATURE: &str = "steps/timestamp";
pub const REWARD_FEATURE: &str = "steps/reward";
pub const DISCOUNT_FEATURE: &str = "steps/discount";
pub const STEP_METADATA_FEATURE: &str = "steps/step_metadata";
pub const LENGTH_SUFFIX: &str = "/len";

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub episodes_per_file: usize,
    pub predicate: Predicate,
    /// Leave out episodes flagged `invalid`.
    pub skip_invalid: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            episodes_per_file: DEFAULT_EPISODES_PER_FILE,
            predicate: Predicate::all(),
            skip_invalid: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportFeature {
    pub dtype: String,
    pub shape: Vec<Option<usize>>,
    /// `per_step` (one entry per step) or `concatenated` (with `/len`).
    pub encoding: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSplit {
    pub num_examples: u64,
    pub num_shards: u64,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportProvenance {
    pub source_dataset: PathBuf,
    pub source_build_id: String,
    pub exported_at: String,
    pub code_version: String,
    pub lossy: bool,
    pub losses: Vec<String>,
    pub actions_denormalized: u64,
}

/// Contents of `dataset_info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub name: String,
    pub dataset_id: String,
    pub format: String,
    pub episodes_per_file: usize,
    pub features: BTreeMap<String, ExportFeature>,
    pub splits: BTreeMap<String, ExportSplit>,
    pub provenance: ExportProvenance,
}

/// Feature name of a step tensor key.
#[must_use]
pub fn feature_name(key: &str) -> String {
    format!("steps/{}", key.replace('.', "/"))
}

// ---------------------------------------------------------------------------
// Episode -> Example
// ---------------------------------------------------------------------------

#[allow(clippy::cast_possible_truncation)]
fn narrow(values: &[f64], name: &str, losses: &mut BTreeSet<String>) -> Vec<f32> {
    let narrowed: Vec<f32> = values.iter().map(|v| *v as f32).collect();
    let exact = values
        .iter()
        .zip(&narrowed)
        .all(|(wide, n)| !wide.is_finite() || f64::from(*n) == *wide);
    if !exact {
        losses.insert(format!("{name}: float64 values narrowed to float32"));
    }
    narrowed
}

fn int_values(data: &TensorData) -> Vec<i64> {
    match coerce(data, DType::Int64) {
        TensorData::Int64(v) => v,
        _ => Vec::new(),
    }
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn flag(b: bool) -> i64 {
    i64::from(b)
}

/// Encode one tensor key across all steps.
fn tensor_features(
    name: &str,
    tensors: &[Option<&Tensor>],
    features: &mut BTreeMap<String, Feature>,
    losses: &mut BTreeSet<String>,
) {
    let Some(first) = tensors.iter().flatten().next() else {
        return;
    };
    if tensors.iter().flatten().all(|t| is_video_frame(t)) {
        let frames = tensors
            .iter()
            .map(|t| match t.map(|t| &t.data) {
                Some(TensorData::Uint8(pixels)) => pixels.clone(),
                _ => Vec::new(),
            })
            .collect();
        features.insert(name.to_string(), Feature::bytes(frames));
        return;
    }

    let dtype = tensors
        .iter()
        .flatten()
        .fold(first.dtype(), |d, t| d.widen(t.dtype()));
    let lengths = tensors.iter().map(|t| count(t.map_or(0, |t| t.len()))).collect();
    let present = tensors.iter().flatten().map(|t| coerce(&t.data, dtype));
    let feature = match dtype {
        DType::Float32 => Feature::floats(
            present
                .flat_map(|d| match d {
                    TensorData::Float32(v) => v,
                    _ => Vec::new(),
                })
                .collect(),
        ),
        DType::Float64 => {
            let wide: Vec<f64> = present
                .flat_map(|d| match d {
                    TensorData::Float64(v) => v,
                    _ => Vec::new(),
                })
                .collect();
            Feature::floats(narrow(&wide, name, losses))
        }
        DType::String => Feature::bytes(
            present
                .flat_map(|d| match d {
                    TensorData::String(v) => v,
                    _ => Vec::new(),
                })
                .map(String::into_bytes)
                .collect(),
        ),
        DType::Bool | DType::Uint8 | DType::Int32 | DType::Int64 => {
            Feature::int64s(present.flat_map(|d| int_values(&d)).collect())
        }
    };
    features.insert(name.to_string(), feature);
    features.insert(format!("{name}{LENGTH_SUFFIX}"), Feature::int64s(lengths));
}

/// Build the Example for one episode.
pub fn episode_example(episode: &Episode, losses: &mut BTreeSet<String>) -> Result<Example> {
    let steps = &episode.steps;
    let mut features = BTreeMap::new();
    let text = |s: &str| Feature::bytes(vec![s.as_bytes().to_vec()]);

    features.insert(EPISODE_ID_FEATURE.to_string(), text(&episode.episode_id));
    features.insert("episode_metadata/dataset_id".to_string(), text(&episode.dataset_id));
    features.insert(TASK_TEXT_FEATURE.to_string(), text(&episode.task_text));
    features.insert(
        "episode_metadata/task_id".to_string(),
        Feature::int64s(vec![i64::from(episode.task_id.unwrap_or_default())]),
    );
    features.insert(
        "episode_metadata/invalid".to_string(),
        Feature::int64s(vec![flag(episode.invalid)]),
    );
    features.insert(
        "episode_metadata/source_episode_index".to_string(),
        Feature::int64s(vec![i64::try_from(episode.source_episode_index).unwrap_or(i64::MAX)]),
    );
    features.insert(
        METADATA_JSON_FEATURE.to_string(),
        Feature::bytes(vec![
            serde_json::to_vec(&episode.episode_metadata).context("Failed to encode episode metadata")?
        ]),
    );

    features.insert(
        IS_FIRST_FEATURE.to_string(),
        Feature::int64s(steps.iter().map(|s| flag(s.is_first)).collect()),
    );
    features.insert(
        IS_LAST_FEATURE.to_string(),
        Feature::int64s(steps.iter().map(|s| flag(s.is_last)).collect()),
    );
    features.insert(
        IS_TERMINAL_FEATURE.to_string(),
        Feature::int64s(steps.iter().map(|s| flag(s.is_terminal)).collect()),
    );
    let timestamps: Vec<f64> = steps.iter().map(|s| s.timestamp).collect();
    features.insert(
        TIMESTAMP_FEATURE.to_string(),
        Feature::floats(narrow(&timestamps, TIMESTAMP_FEATURE, losses)),
    );
    if steps.iter().any(|s| s.reward.is_none()) {
        losses.insert(format!("{REWARD_FEATURE}: missing rewards exported as 0"));
    }
    let rewards: Vec<f64> = steps.iter().map(|s| s.reward.unwrap_or(0.0)).collect();
    features.insert(REWARD_FEATURE.to_string(), Feature::floats(narrow(&rewards, REWARD_FEATURE, losses)));
    if steps.iter().any(|s| s.discount.is_none()) {
        losses.insert(format!("{DISCOUNT_FEATURE}: missing discounts exported as 1"));
    }
    let discounts: Vec<f64> = steps.iter().map(|s| s.discount.unwrap_or(1.0)).collect();
    features.insert(
        DISCOUNT_FEATURE.to_string(),
        Feature::floats(narrow(&discounts, DISCOUNT_FEATURE, losses)),
    );

    let actions: Vec<Option<&Tensor>> = steps.iter().map(|s| s.action.as_ref()).collect();
    tensor_features(&feature_name(ACTION_COLUMN), &actions, &mut features, losses);
    let keys: BTreeSet<&String> = steps.iter().flat_map(|s| s.observation.keys()).collect();
    for key in keys {
        let tensors: Vec<Option<&Tensor>> = steps.iter().map(|s| s.observation.get(key)).collect();
        tensor_features(&feature_name(key), &tensors, &mut features, losses);
    }

    let mut step_metadata = Vec::with_capacity(steps.len());
    for step in steps {
        step_metadata.push(serde_json::to_vec(&step.step_metadata).context("Failed to encode step metadata")?);
    }
    features.insert(STEP_METADATA_FEATURE.to_string(), Feature::bytes(step_metadata));
    Ok(Example::new(features))
}

fn export_feature(key: &str, spec: &FeatureSpec) -> (String, ExportFeature) {
    let (dtype, encoding) = if spec.is_video {
        ("uint8", "per_step")
    } else {
        match spec.dtype {
            DType::Float32 | DType::Float64 => ("float32", "concatenated"),
            DType::String => ("bytes", "concatenated"),
            DType::Bool | DType::Uint8 | DType::Int32 | DType::Int64 => ("int64", "concatenated"),
        }
    };
    (
        feature_name(key),
        ExportFeature {
            dtype: dtype.to_string(),
            shape: spec.shape.clone(),
            encoding: encoding.to_string(),
        },
    )
}

fn scalar_feature(dtype: &str) -> ExportFeature {
    ExportFeature {
        dtype: dtype.to_string(),
        shape: Vec::new(),
        encoding: "per_step".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

struct SplitFiles {
    split: String,
    dir: PathBuf,
    per_file: usize,
    current: Option<TfRecordWriter<BufWriter<File>>>,
    in_current: usize,
    summary: ExportSplit,
}

impl SplitFiles {
    fn new(root: &Path, split: &str, per_file: usize) -> Self {
        Self {
            split: split.to_string(),
            dir: root.join(split),
            per_file,
            current: None,
            in_current: 0,
            summary: ExportSplit::default(),
        }
    }

    fn write(&mut self, payload: &[u8]) -> Result<()> {
        if self.current.is_none() || self.in_current >= self.per_file {
            self.close()?;
            std::fs::create_dir_all(&self.dir)
                .with_context(|| format!("Failed to create {}", self.dir.display()))?;
            let name = format!("{}-{:05}.tfrecord", self.split, self.summary.files.len());
            let path = self.dir.join(&name);
            let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
            self.current = Some(TfRecordWriter::new(BufWriter::new(file)));
            self.in_current = 0;
            self.summary.files.push(format!("{}/{name}", self.split));
            self.summary.num_shards += 1;
        }
        if let Some(writer) = self.current.as_mut() {
            writer.write_record(payload).context("Failed to write TFRecord")?;
        }
        self.in_current += 1;
        self.summary.num_examples += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            let file = writer
                .finish()
                .and_then(|buf| buf.into_inner().map_err(std::io::IntoInnerError::into_error))
                .context("Failed to flush TFRecord file")?;
            file.sync_all().context("Failed to sync TFRecord file")?;
        }
        Ok(())
    }
}

/// Export the main partition of the dataset at `source` into `output`.
pub fn export_dataset(source: &Path, output: &Path, options: &ExportOptions) -> Result<ExportInfo> {
    if options.episodes_per_file == 0 {
        bail!("episodes_per_file must be at least 1");
    }
    let mut reader = DatasetReader::open(DatasetLayout::new(source), Partition::Main)?;
    let info = reader.info().clone();
    let normalized = info
        .provenance
        .transform_pipeline
        .iter()
        .any(|t| t.name == NORMALIZE_ACTIONS);

    std::fs::create_dir_all(output).with_context(|| format!("Failed to create {}", output.display()))?;
    let records: Vec<_> = reader
        .records()
        .iter()
        .filter(|r| !(options.skip_invalid && r.invalid) && options.predicate.matches(r))
        .cloned()
        .collect();

    let mut losses = BTreeSet::new();
    let mut denormalized = 0u64;
    let mut splits: BTreeMap<String, SplitFiles> = BTreeMap::new();
    for record in &records {
        let mut episode = reader.read_episode(record)?;
        match ActionNormalization::from_episode(&episode) {
            Some(bounds) => {
                for step in &mut episode.steps {
                    if let Some(values) = step.action.as_ref().and_then(Tensor::to_f64_vec) {
                        step.action = Some(Tensor::vector_f64(bounds.denormalize(&values)));
                    }
                }
                denormalized += 1;
            }
            None if normalized => {
                losses.insert(
                    "steps/action: normalised without recorded bounds, exported in [-1, 1]".to_string(),
                );
            }
            None => {}
        }
        let example = episode_example(&episode, &mut losses)?;
        splits
            .entry(record.split.clone())
            .or_insert_with(|| SplitFiles::new(output, &record.split, options.episodes_per_file))
            .write(&example.encode_to_vec())?;
    }
    for files in splits.values_mut() {
        files.close()?;
    }

    let mut features: BTreeMap<String, ExportFeature> = info
        .features
        .iter()
        .map(|(key, spec)| export_feature(key, spec))
        .collect();
    for name in [IS_FIRST_FEATURE, IS_LAST_FEATURE, IS_TERMINAL_FEATURE] {
        features.insert(name.to_string(), scalar_feature("int64"));
    }
    for name in [TIMESTAMP_FEATURE, REWARD_FEATURE, DISCOUNT_FEATURE] {
        features.insert(name.to_string(), scalar_feature("float32"));
    }
    features.insert(STEP_METADATA_FEATURE.to_string(), scalar_feature("bytes"));

    let losses: Vec<String> = losses.into_iter().collect();
    let export = ExportInfo {
        name: info.dataset_name.clone(),
        dataset_id: info.dataset_id.clone(),
        format: EXPORT_FORMAT.to_string(),
        episodes_per_file: options.episodes_per_file,
        features,
        splits: splits.into_iter().map(|(split, files)| (split, files.summary)).collect(),
        provenance: ExportProvenance {
            source_dataset: source.to_path_buf(),
            source_build_id: info.provenance.build_id.to_string(),
            exported_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            code_version: CODE_VERSION.to_string(),
            lossy: !losses.is_empty(),
            losses,
            actions_denormalized: denormalized,
        },
    };
    write_json(&output.join(DATASET_INFO_FILE), &export)?;
    if export.provenance.lossy {
        for loss in &export.provenance.losses {
            tracing::warn!(loss = loss.as_str(), "Export is lossy");
        }
    }
    tracing::info!(
        episodes = records.len(),
        splits = export.splits.len(),
        lossy = export.provenance.lossy,
        "Export complete"
    );
    Ok(export)
}

/// Decode every Example in one exported file.
pub fn read_examples(path: &Path) -> Result<Vec<Example>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    TfRecordReader::new(std::io::BufReader::new(file))
        .map(|payload| {
            let payload = payload.with_context(|| format!("Corrupt record in {}", path.display()))?;
            Example::decode(payload.as_slice()).with_context(|| format!("Bad Example in {}", path.display()))
        })
        .collect()
}
