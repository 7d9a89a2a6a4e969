//! Canonical Episode/Step model.
//!
//! Every source dataset is mapped onto these two types before any
//! transform, validation rule or writer sees it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Observation key prefix for camera images.
pub const IMAGE_PREFIX: &str = "observation.images.";
/// Observation key prefix for language instructions.
pub const LANGUAGE_PREFIX: &str = "observation.language.";
/// Key the camera selection transform writes the chosen view to.
pub const CANONICAL_IMAGE_KEY: &str = "observation.images.canonical";

/// Camera name of an image observation key, if it is one.
#[must_use]
pub fn camera_name(key: &str) -> Option<&str> {
    key.strip_prefix(IMAGE_PREFIX)
}

/// One timestep within an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub is_first: bool,
    pub is_last: bool,
    #[serde(default)]
    pub is_terminal: bool,
    /// Dotted key (e.g. `observation.images.front`) to value.
    #[serde(default)]
    pub observation: BTreeMap<String, Tensor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Tensor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<f64>,
    /// Seconds since the start of the episode.
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub step_metadata: BTreeMap<String, serde_json::Value>,
}

impl Step {
    /// A step with flags and timestamp set and nothing else.
    #[must_use]
    pub fn new(is_first: bool, is_last: bool, timestamp: f64) -> Self {
        Self {
            is_first,
            is_last,
            is_terminal: false,
            observation: BTreeMap::new(),
            action: None,
            reward: None,
            discount: None,
            timestamp,
            step_metadata: BTreeMap::new(),
        }
    }

    /// Image observations keyed by camera name.
    pub fn images(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.observation
            .iter()
            .filter_map(|(key, value)| camera_name(key).map(|cam| (cam, value)))
    }
}

/// One complete trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Globally unique within a build.
    pub episode_id: String,
    pub dataset_id: String,
    /// Position of this episode in the source, before any selector.
    #[serde(default)]
    pub source_episode_index: u64,
    pub steps: Vec<Step>,
    /// Assigned by the writer from the task catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u32>,
    #[serde(default)]
    pub task_text: String,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub episode_metadata: BTreeMap<String, serde_json::Value>,
}

impl Episode {
    #[must_use]
    pub fn new(episode_id: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            episode_id: episode_id.into(),
            dataset_id: dataset_id.into(),
            source_episode_index: 0,
            steps: Vec::new(),
            task_id: None,
            task_text: String::new(),
            invalid: false,
            episode_metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    /// Elapsed time between the first and last step.
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        match (self.steps.first(), self.steps.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).max(0.0),
            _ => 0.0,
        }
    }

    /// Sorted camera names present on the first step.
    #[must_use]
    pub fn cameras(&self) -> Vec<String> {
        self.steps
            .first()
            .map(|step| step.images().map(|(cam, _)| cam.to_string()).collect())
            .unwrap_or_default()
    }

    /// String metadata value, if present.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.episode_metadata.get(key).and_then(|v| v.as_str())
    }

    /// Fix up `is_first`/`is_last` so step 0 is first and the final step is last.
    pub fn mark_boundaries(&mut self) {
        let last = self.steps.len().saturating_sub(1);
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.is_first = i == 0;
            step.is_last = i == last;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode_with_steps(n: usize) -> Episode {
        let mut ep = Episode::new("ep-0", "ds");
        for i in 0..n {
            ep.steps.push(Step::new(false, false, f64::from(i as u32) * 0.1));
        }
        ep.mark_boundaries();
        ep
    }

    #[test]
    fn mark_boundaries_sets_first_and_last() {
        let ep = episode_with_steps(4);
        assert!(ep.steps[0].is_first);
        assert!(ep.steps[3].is_last);
        assert_eq!(ep.steps.iter().filter(|s| s.is_first).count(), 1);
        assert_eq!(ep.steps.iter().filter(|s| s.is_last).count(), 1);
    }

    #[test]
    fn single_step_is_both_first_and_last() {
        let ep = episode_with_steps(1);
        assert!(ep.steps[0].is_first && ep.steps[0].is_last);
    }

    #[test]
    fn duration_spans_first_to_last() {
        let ep = episode_with_steps(11);
        assert!((ep.duration_secs() - 1.0).abs() < 1e-9);
        assert!(Episode::new("e", "d").duration_secs().abs() < f64::EPSILON);
    }

    #[test]
    fn cameras_are_derived_from_image_keys() {
        let mut ep = episode_with_steps(1);
        let img = Tensor::image(1, 1, 3, vec![0, 0, 0]).unwrap();
        ep.steps[0]
            .observation
            .insert("observation.images.wrist".into(), img.clone());
        ep.steps[0]
            .observation
            .insert("observation.images.front".into(), img);
        ep.steps[0]
            .observation
            .insert("observation.state".into(), Tensor::vector_f32(vec![0.0]));
        assert_eq!(ep.cameras(), vec!["front".to_string(), "wrist".to_string()]);
    }

    #[test]
    fn episode_json_defaults() {
        let json = r#"{"episode_id":"a","dataset_id":"d","steps":[{"is_first":true,"is_last":true}]}"#;
        let ep: Episode = serde_json::from_str(json).unwrap();
        assert_eq!(ep.num_steps(), 1);
        assert!(!ep.invalid);
        assert!(ep.task_id.is_none());
        assert!(ep.steps[0].action.is_none());
    }
}
