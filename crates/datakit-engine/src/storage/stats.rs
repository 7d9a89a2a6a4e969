//! Streaming per-feature statistics.
//!
//! Each feature keeps a Welford accumulator per element position. The
//! writer holds one accumulator for the open shard and merges it into the
//! committed one only when the shard commits, so discarded shards never
//! leak into `stats.json`.

use std::collections::BTreeMap;

use datakit_types::episode::Episode;
use serde::{Deserialize, Serialize};

pub const ACTION_FEATURE: &str = "action";
pub const TIMESTAMP_FEATURE: &str = "timestamp";
pub const REWARD_FEATURE: &str = "reward";

/// Welford state for one scalar stream.
///
/// `min`/`max` stay `None` until a finite value arrives, so the state is
/// always representable in JSON checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Welford {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

fn fold(current: Option<f64>, value: f64, pick: fn(f64, f64) -> f64) -> Option<f64> {
    Some(current.map_or(value, |c| pick(c, value)))
}

impl Welford {
    /// Add one observation. Non-finite values are ignored.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
        self.min = fold(self.min, value, f64::min);
        self.max = fold(self.max, value, f64::max);
    }

    /// Combine two accumulators (Chan et al. parallel update).
    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let (na, nb) = (self.count as f64, other.count as f64);
        let n = na + nb;
        let delta = other.mean - self.mean;
        self.mean += delta * nb / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.count += other.count;
        if let Some(min) = other.min {
            self.min = fold(self.min, min, f64::min);
        }
        if let Some(max) = other.max {
            self.max = fold(self.max, max, f64::max);
        }
    }

    /// Population variance.
    #[must_use]
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        (self.m2 / n).max(0.0)
    }
}

/// Per-element accumulators for one feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub elements: Vec<Welford>,
}

impl FeatureStats {
    pub fn push(&mut self, values: &[f64]) {
        if self.elements.len() < values.len() {
            self.elements.resize(values.len(), Welford::default());
        }
        for (acc, v) in self.elements.iter_mut().zip(values) {
            acc.push(*v);
        }
    }

    pub fn merge(&mut self, other: &Self) {
        if self.elements.len() < other.elements.len() {
            self.elements.resize(other.elements.len(), Welford::default());
        }
        for (acc, o) in self.elements.iter_mut().zip(&other.elements) {
            acc.merge(o);
        }
    }

    #[must_use]
    pub fn summary(&self) -> FeatureSummary {
        FeatureSummary {
            count: self.elements.iter().map(|e| e.count).max().unwrap_or(0),
            mean: self.elements.iter().map(|e| e.mean).collect(),
            std: self.elements.iter().map(|e| e.variance().sqrt()).collect(),
            min: self.elements.iter().map(|e| e.min.unwrap_or(0.0)).collect(),
            max: self.elements.iter().map(|e| e.max.unwrap_or(0.0)).collect(),
        }
    }
}

/// One entry of `meta/stats.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub count: u64,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

/// Statistics over every numeric, non-video feature of a partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsAccumulator {
    pub features: BTreeMap<String, FeatureStats>,
}

impl StatsAccumulator {
    /// Fold one written episode into the accumulator. `is_video` says which
    /// observation keys went to video shards; those are skipped.
    pub fn observe(&mut self, episode: &Episode, is_video: impl Fn(&str) -> bool) {
        for step in &episode.steps {
            self.feature(TIMESTAMP_FEATURE).push(&[step.timestamp]);
            if let Some(reward) = step.reward {
                self.feature(REWARD_FEATURE).push(&[reward]);
            }
            if let Some(values) = step.action.as_ref().and_then(|a| a.to_f64_vec()) {
                self.feature(ACTION_FEATURE).push(&values);
            }
            for (key, tensor) in &step.observation {
                if is_video(key) {
                    continue;
                }
                if let Some(values) = tensor.to_f64_vec() {
                    self.feature(key).push(&values);
                }
            }
        }
    }

    pub fn merge(&mut self, other: &Self) {
        for (key, stats) in &other.features {
            self.feature(key).merge(stats);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> BTreeMap<String, FeatureSummary> {
        self.features
            .iter()
            .map(|(key, stats)| (key.clone(), stats.summary()))
            .collect()
    }

    fn feature(&mut self, key: &str) -> &mut FeatureStats {
        self.features.entry(key.to_string()).or_default()
    }
}
