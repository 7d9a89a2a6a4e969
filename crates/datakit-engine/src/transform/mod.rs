//! Named, ordered Episode -> Episode transforms.
//!
//! Every transform satisfies [`Transform`] and is built by name from a
//! [`TransformRegistry`] factory that validates its parameters up front, so
//! a bad pipeline fails at config load rather than on the first episode.

pub mod action;
pub mod camera;
pub mod image;
pub mod task;
pub mod timestamp;

use std::collections::BTreeMap;

use datakit_types::episode::Episode;
use datakit_types::provenance::TransformStep;
use datakit_types::spec::DatasetSpec;
use datakit_types::tensor::TensorError;
use serde_json::{Map, Value};

use crate::cancel::CancelToken;

pub type Params = Map<String, Value>;

/// Typed transform failures. Each becomes a synthetic ERROR finding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("camera '{camera}' not found (available: {available:?})")]
    CameraNotFound {
        camera: String,
        available: Vec<String>,
    },
    #[error("malformed tensor '{key}': {reason}")]
    MalformedTensor { key: String, reason: String },
    #[error("empty task text")]
    EmptyTaskText,
    #[error("invalid parameter '{param}' for transform '{transform}': {reason}")]
    InvalidParam {
        transform: String,
        param: String,
        reason: String,
    },
    #[error("unknown transform '{0}'")]
    UnknownTransform(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// What a transform may read besides the episode.
pub struct TransformContext<'a> {
    /// Read-only; transforms never mutate the dataset spec.
    pub spec: &'a DatasetSpec,
    pub cancel: &'a CancelToken,
}

pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns a [`TransformError`] when the episode cannot be transformed.
    fn apply(&self, episode: Episode, ctx: &TransformContext<'_>) -> Result<Episode, TransformError>;
}

/// Builds a transform from its configured parameters.
pub type TransformFactory = fn(&Params) -> Result<Box<dyn Transform>, TransformError>;

/// Transform name to factory.
#[derive(Debug, Clone)]
pub struct TransformRegistry {
    factories: BTreeMap<String, TransformFactory>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TransformRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.insert(camera::SELECT_CAMERA, camera::SelectCamera::build);
        registry.insert(image::RESIZE_IMAGES, image::ResizeImages::build);
        registry.insert(action::NORMALIZE_ACTIONS, action::NormalizeActions::build);
        registry.insert(action::PAD_ACTION, action::PadAction::build);
        registry.insert(task::TASK_TEXT, task::TaskText::build);
        registry.insert(timestamp::TIMESTAMP_CANONICALIZE, timestamp::TimestampCanonicalize::build);
        registry
    }

    fn insert(&mut self, name: &str, factory: TransformFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Register an external transform.
    ///
    /// # Errors
    ///
    /// Fails if `name` is already taken.
    pub fn register(&mut self, name: &str, factory: TransformFactory) -> Result<(), TransformError> {
        if self.factories.contains_key(name) {
            return Err(TransformError::InvalidParam {
                transform: name.to_string(),
                param: "name".to_string(),
                reason: "already registered".to_string(),
            });
        }
        self.insert(name, factory);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate one configured step.
    ///
    /// # Errors
    ///
    /// Fails for unknown names or parameters the factory rejects.
    pub fn build(&self, step: &TransformStep) -> Result<Box<dyn Transform>, TransformError> {
        let factory = self
            .factories
            .get(&step.name)
            .ok_or_else(|| TransformError::UnknownTransform(step.name.clone()))?;
        factory(&step.params)
    }
}

/// A failure tagged with the transform that raised it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("transform '{transform}' failed: {source}")]
pub struct TransformFailure {
    pub transform: String,
    #[source]
    pub source: TransformError,
}

impl TransformFailure {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.source == TransformError::Cancelled
    }
}

/// Configured transforms, applied strictly in order.
pub struct TransformPipeline {
    steps: Vec<Box<dyn Transform>>,
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl TransformPipeline {
    /// # Errors
    ///
    /// Fails on the first step the registry cannot build.
    pub fn build(registry: &TransformRegistry, steps: &[TransformStep]) -> Result<Self, TransformError> {
        let steps = steps
            .iter()
            .map(|step| registry.build(step))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|t| t.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step; step N's output feeds step N+1.
    ///
    /// # Errors
    ///
    /// Returns the first failure, tagged with the failing transform's name.
    pub fn apply(
        &self,
        mut episode: Episode,
        spec: &DatasetSpec,
        cancel: &CancelToken,
    ) -> Result<Episode, TransformFailure> {
        let ctx = TransformContext { spec, cancel };
        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(TransformFailure {
                    transform: step.name().to_string(),
                    source: TransformError::Cancelled,
                });
            }
            episode = step.apply(episode, &ctx).map_err(|source| TransformFailure {
                transform: step.name().to_string(),
                source,
            })?;
        }
        Ok(episode)
    }
}

// ---------------------------------------------------------------------------
// Parameter helpers
// ---------------------------------------------------------------------------

pub(crate) struct ParamReader<'a> {
    transform: &'static str,
    params: &'a Params,
}

impl<'a> ParamReader<'a> {
    /// Rejects keys outside `allowed`.
    pub(crate) fn new(
        transform: &'static str,
        params: &'a Params,
        allowed: &[&str],
    ) -> Result<Self, TransformError> {
        if let Some(unknown) = params.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(TransformError::InvalidParam {
                transform: transform.to_string(),
                param: unknown.clone(),
                reason: format!("unknown parameter (expected one of {allowed:?})"),
            });
        }
        Ok(Self { transform, params })
    }

    pub(crate) fn invalid(&self, param: &str, reason: impl Into<String>) -> TransformError {
        TransformError::InvalidParam {
            transform: self.transform.to_string(),
            param: param.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn string(&self, key: &str) -> Result<Option<String>, TransformError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {other}"))),
        }
    }

    pub(crate) fn boolean(&self, key: &str, default: bool) -> Result<bool, TransformError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(self.invalid(key, format!("expected a boolean, got {other}"))),
        }
    }

    pub(crate) fn number(&self, key: &str) -> Result<Option<f64>, TransformError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, format!("expected a number, got {value}"))),
        }
    }

    pub(crate) fn positive_usize(&self, key: &str) -> Result<Option<usize>, TransformError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .filter(|v| *v > 0)
                .and_then(|v| usize::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| self.invalid(key, format!("expected a positive integer, got {value}"))),
        }
    }

    pub(crate) fn strings(&self, key: &str) -> Result<Option<Vec<String>>, TransformError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.invalid(key, "expected a list of strings"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(other) => Err(self.invalid(key, format!("expected a list, got {other}"))),
        }
    }

    /// A number or a list of numbers.
    pub(crate) fn numbers(&self, key: &str) -> Result<Option<Vec<f64>>, TransformError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_f64()
                        .ok_or_else(|| self.invalid(key, "expected a list of numbers"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(value) => value
                .as_f64()
                .map(|v| Some(vec![v]))
                .ok_or_else(|| self.invalid(key, format!("expected a number or list, got {value}"))),
        }
    }
}
