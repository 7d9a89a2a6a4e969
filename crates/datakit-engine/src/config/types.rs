//! Serde model of the compile configuration file.

use std::collections::BTreeMap;
use std::path::PathBuf;

use datakit_types::finding::Severity;
use datakit_types::provenance::TransformStep;
use serde::{Deserialize, Serialize};

/// Top-level compile configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileConfig {
    pub source: SourceConfig,
    pub output: OutputConfig,
    /// Transform steps in application order.
    #[serde(default)]
    pub transforms: Vec<TransformStep>,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub splits: SplitConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Location of the canonical episode source.
    pub uri: String,
    /// Source dataset version; part of the build id.
    #[serde(default)]
    pub version: String,
    /// Optional `[start:end]` slice applied before compilation.
    #[serde(default)]
    pub selector: Option<String>,
    /// Source split to read.
    #[serde(default = "default_source_split")]
    pub split: String,
}

fn default_source_split() -> String {
    "train".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Overrides the dataset name reported by the source.
    #[serde(default)]
    pub dataset_name: Option<String>,
}

/// Validation modes, thresholds and severity overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub quarantine: bool,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub skip_validation: bool,
    #[serde(default = "default_min_episode_length")]
    pub min_episode_length: usize,
    #[serde(default = "default_max_episode_length")]
    pub max_episode_length: usize,
    #[serde(default = "default_action_bounds")]
    pub action_bounds: [f64; 2],
    #[serde(default = "default_action_sigma_threshold")]
    pub action_sigma_threshold: f64,
    #[serde(default = "default_timestamp_gap_factor")]
    pub timestamp_gap_factor: f64,
    /// Rule code to severity. May only escalate.
    #[serde(default)]
    pub severity_overrides: BTreeMap<String, Severity>,
    #[serde(default = "default_max_findings_per_code")]
    pub max_findings_per_code: usize,
    /// Fraction of invalid episodes above which the run exits with the
    /// warning-threshold code.
    #[serde(default)]
    pub max_invalid_ratio: Option<f64>,
}

fn default_min_episode_length() -> usize {
    1
}

fn default_max_episode_length() -> usize {
    100_000
}

fn default_action_bounds() -> [f64; 2] {
    [-10.0, 10.0]
}

fn default_action_sigma_threshold() -> f64 {
    5.0
}

fn default_timestamp_gap_factor() -> f64 {
    2.0
}

fn default_max_findings_per_code() -> usize {
    100
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            quarantine: false,
            strict: false,
            skip_validation: false,
            min_episode_length: default_min_episode_length(),
            max_episode_length: default_max_episode_length(),
            action_bounds: default_action_bounds(),
            action_sigma_threshold: default_action_sigma_threshold(),
            timestamp_gap_factor: default_timestamp_gap_factor(),
            severity_overrides: BTreeMap::new(),
            max_findings_per_code: default_max_findings_per_code(),
            max_invalid_ratio: None,
        }
    }
}

/// Shard flush thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingConfig {
    #[serde(default = "default_episodes_per_shard")]
    pub episodes_per_shard: usize,
    /// Step rows per tabular shard (and frames per video shard).
    #[serde(default = "default_frames_per_shard")]
    pub frames_per_shard: u64,
}

fn default_episodes_per_shard() -> usize {
    1000
}

fn default_frames_per_shard() -> u64 {
    100_000
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            episodes_per_shard: default_episodes_per_shard(),
            frames_per_shard: default_frames_per_shard(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// In-flight episodes per worker on each bounded queue.
    #[serde(default = "default_queue_depth_per_worker")]
    pub queue_depth_per_worker: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub resume: bool,
}

fn default_workers() -> usize {
    1
}

fn default_queue_depth_per_worker() -> usize {
    2
}

fn default_seed() -> u64 {
    42
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth_per_worker: default_queue_depth_per_worker(),
            seed: default_seed(),
            resume: false,
        }
    }
}

impl ExecutionConfig {
    /// Capacity of the work and result queues.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.workers.max(1) * self.queue_depth_per_worker.max(1)
    }
}

/// Deterministic train/val/test fractions; `test` takes the remainder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    #[serde(default = "default_train_fraction")]
    pub train: f64,
    #[serde(default = "default_val_fraction")]
    pub val: f64,
}

fn default_train_fraction() -> f64 {
    0.8
}

fn default_val_fraction() -> f64 {
    0.1
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train: default_train_fraction(),
            val: default_val_fraction(),
        }
    }
}
