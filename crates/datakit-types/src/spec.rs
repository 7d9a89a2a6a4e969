//! Dataset schema and modality registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tasks::TaskCatalog;
use crate::tensor::{DType, Tensor};

/// Canonical action space semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpaceType {
    /// Delta end-effector pose (x, y, z, roll, pitch, yaw, gripper).
    #[serde(rename = "ee_delta_7")]
    EeDelta7,
    #[serde(rename = "ee_abs_7")]
    EeAbs7,
    #[serde(rename = "ee_velocity_7")]
    EeVelocity7,
    JointDelta,
    JointAbs,
    JointVelocity,
    #[default]
    Custom,
}

impl ActionSpaceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EeDelta7 => "ee_delta_7",
            Self::EeAbs7 => "ee_abs_7",
            Self::EeVelocity7 => "ee_velocity_7",
            Self::JointDelta => "joint_delta",
            Self::JointAbs => "joint_abs",
            Self::JointVelocity => "joint_velocity",
            Self::Custom => "custom",
        }
    }

    /// Fixed action dimension implied by the space, if any.
    #[must_use]
    pub fn expected_dim(self) -> Option<usize> {
        match self {
            Self::EeDelta7 | Self::EeAbs7 | Self::EeVelocity7 => Some(7),
            Self::JointDelta | Self::JointAbs | Self::JointVelocity | Self::Custom => None,
        }
    }
}

impl std::fmt::Display for ActionSpaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type and shape of one feature.
///
/// A `None` entry in `shape` is a wildcard: that dimension may vary
/// between episodes (but not between steps of one episode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub dtype: DType,
    pub shape: Vec<Option<usize>>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_video: bool,
}

impl FeatureSpec {
    #[must_use]
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: shape.iter().copied().map(Some).collect(),
            description: String::new(),
            is_video: false,
        }
    }

    #[must_use]
    pub fn video(mut self) -> Self {
        self.is_video = true;
        self
    }

    /// `true` if `tensor` has the declared dtype and a compatible shape.
    #[must_use]
    pub fn accepts(&self, tensor: &Tensor) -> bool {
        tensor.dtype() == self.dtype && self.shape_matches(&tensor.shape)
    }

    #[must_use]
    pub fn shape_matches(&self, shape: &[usize]) -> bool {
        self.shape.len() == shape.len()
            && self
                .shape
                .iter()
                .zip(shape)
                .all(|(declared, actual)| declared.map_or(true, |d| d == *actual))
    }
}

/// Schema, modality registry and provenance of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub dataset_id: String,
    pub dataset_name: String,
    #[serde(default)]
    pub observation_schema: BTreeMap<String, FeatureSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_schema: Option<FeatureSpec>,
    #[serde(default = "default_control_rate_hz")]
    pub control_rate_hz: f64,
    #[serde(default)]
    pub action_space_type: ActionSpaceType,
    #[serde(default)]
    pub camera_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_camera: Option<String>,
    #[serde(default)]
    pub task_catalog: TaskCatalog,
    #[serde(default)]
    pub source_uri: String,
    #[serde(default)]
    pub build_id: String,
    /// Transform names in application order.
    #[serde(default)]
    pub transform_pipeline: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_metadata: BTreeMap<String, serde_json::Value>,
}

fn default_control_rate_hz() -> f64 {
    10.0
}

impl DatasetSpec {
    #[must_use]
    pub fn new(dataset_id: impl Into<String>, dataset_name: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            dataset_name: dataset_name.into(),
            observation_schema: BTreeMap::new(),
            action_schema: None,
            control_rate_hz: default_control_rate_hz(),
            action_space_type: ActionSpaceType::Custom,
            camera_names: Vec::new(),
            canonical_camera: None,
            task_catalog: TaskCatalog::default(),
            source_uri: String::new(),
            build_id: String::new(),
            transform_pipeline: Vec::new(),
            extra_metadata: BTreeMap::new(),
        }
    }

    /// Observation keys declared as video streams.
    pub fn video_keys(&self) -> impl Iterator<Item = &str> {
        self.observation_schema
            .iter()
            .filter(|(_, spec)| spec.is_video)
            .map(|(key, _)| key.as_str())
    }

    #[must_use]
    pub fn is_video_key(&self, key: &str) -> bool {
        self.observation_schema
            .get(key)
            .is_some_and(|spec| spec.is_video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_space_type_wire_names() {
        let json = serde_json::to_string(&ActionSpaceType::EeDelta7).unwrap();
        assert_eq!(json, "\"ee_delta_7\"");
        let back: ActionSpaceType = serde_json::from_str("\"joint_velocity\"").unwrap();
        assert_eq!(back, ActionSpaceType::JointVelocity);
        assert!(serde_json::from_str::<ActionSpaceType>("\"teleport\"").is_err());
    }

    #[test]
    fn wildcard_dimension_accepts_any_length() {
        let spec = FeatureSpec {
            dtype: DType::Float32,
            shape: vec![None],
            description: String::new(),
            is_video: false,
        };
        assert!(spec.accepts(&Tensor::vector_f32(vec![0.0; 3])));
        assert!(spec.accepts(&Tensor::vector_f32(vec![0.0; 9])));
        assert!(!spec.accepts(&Tensor::vector_f64(vec![0.0; 3])));
    }

    #[test]
    fn fixed_dimension_must_match() {
        let spec = FeatureSpec::new(DType::Uint8, &[2, 2, 3]);
        assert!(spec.accepts(&Tensor::image(2, 2, 3, vec![0; 12]).unwrap()));
        assert!(!spec.accepts(&Tensor::image(2, 3, 3, vec![0; 18]).unwrap()));
    }

    #[test]
    fn video_keys_only_lists_video_features() {
        let mut spec = DatasetSpec::new("ds", "Dataset");
        spec.observation_schema.insert(
            "observation.images.front".into(),
            FeatureSpec::new(DType::Uint8, &[4, 4, 3]).video(),
        );
        spec.observation_schema.insert(
            "observation.state".into(),
            FeatureSpec::new(DType::Float32, &[7]),
        );
        assert_eq!(
            spec.video_keys().collect::<Vec<_>>(),
            vec!["observation.images.front"]
        );
        assert!(spec.is_video_key("observation.images.front"));
        assert!(!spec.is_video_key("observation.state"));
    }

    #[test]
    fn spec_defaults_from_minimal_json() {
        let spec: DatasetSpec =
            serde_json::from_str(r#"{"dataset_id":"d","dataset_name":"D"}"#).unwrap();
        assert!((spec.control_rate_hz - 10.0).abs() < f64::EPSILON);
        assert_eq!(spec.action_space_type, ActionSpaceType::Custom);
        assert!(spec.task_catalog.is_empty());
    }
}
