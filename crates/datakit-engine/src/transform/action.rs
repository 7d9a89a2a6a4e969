//! Action normalisation and padding.

use datakit_types::episode::Episode;
use datakit_types::tensor::Tensor;
use serde::{Deserialize, Serialize};

use super::{ParamReader, Params, Transform, TransformContext, TransformError};

pub const NORMALIZE_ACTIONS: &str = "normalize_actions";
pub const PAD_ACTION: &str = "pad_action";

/// Episode metadata key holding the pre-normalisation bounds.
pub const NORMALIZATION_METADATA_KEY: &str = "action_normalization";

const MIN_RANGE: f64 = 1e-8;

/// Bounds recorded by [`NormalizeActions`] so exporters can invert it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNormalization {
    pub method: String,
    pub low: Vec<f64>,
    pub high: Vec<f64>,
    pub clip: bool,
}

impl ActionNormalization {
    /// Map a normalised action back to the original range. Clipped values
    /// come back as the bound they were clipped to.
    #[must_use]
    pub fn denormalize(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .enumerate()
            .map(|(d, v)| {
                let (low, high) = self.bounds(d);
                (v + 1.0) / 2.0 * (high - low) + low
            })
            .collect()
    }

    fn normalize(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .enumerate()
            .map(|(d, v)| {
                let (low, high) = self.bounds(d);
                let n = 2.0 * (v - low) / (high - low) - 1.0;
                if self.clip {
                    n.clamp(-1.0, 1.0)
                } else {
                    n
                }
            })
            .collect()
    }

    /// A single bound broadcasts over every dimension.
    fn bounds(&self, dim: usize) -> (f64, f64) {
        let pick = |v: &[f64]| v.get(dim).or_else(|| v.last()).copied().unwrap_or(0.0);
        (pick(&self.low), pick(&self.high))
    }

    /// Read the bounds stored on an episode, if any.
    #[must_use]
    pub fn from_episode(episode: &Episode) -> Option<Self> {
        episode
            .episode_metadata
            .get(NORMALIZATION_METADATA_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn action_values(episode: &Episode, step: usize, action: &Tensor) -> Result<Vec<f64>, TransformError> {
    action.to_f64_vec().ok_or_else(|| TransformError::MalformedTensor {
        key: "action".to_string(),
        reason: format!(
            "step {step} of episode {} has a non-numeric action",
            episode.episode_id
        ),
    })
}

/// Scales actions to [-1, 1] using configured bounds, or the episode's own
/// per-dimension min/max when none are configured.
#[derive(Debug, Clone)]
pub struct NormalizeActions {
    low: Option<Vec<f64>>,
    high: Option<Vec<f64>>,
    clip: bool,
}

impl NormalizeActions {
    /// # Errors
    ///
    /// `low` and `high` must be given together, with equal lengths and
    /// `low < high` in every dimension.
    pub fn build(params: &Params) -> Result<Box<dyn Transform>, TransformError> {
        let reader = ParamReader::new(NORMALIZE_ACTIONS, params, &["low", "high", "clip"])?;
        let low = reader.numbers("low")?;
        let high = reader.numbers("high")?;
        match (&low, &high) {
            (Some(lo), Some(hi)) => {
                if lo.len() != hi.len() || lo.is_empty() {
                    return Err(reader.invalid("high", "low and high must have the same non-zero length"));
                }
                if lo.iter().zip(hi).any(|(l, h)| l >= h) {
                    return Err(reader.invalid("high", "every high bound must exceed its low bound"));
                }
            }
            (None, None) => {}
            _ => return Err(reader.invalid("low", "low and high must be set together")),
        }
        Ok(Box::new(Self {
            low,
            high,
            clip: reader.boolean("clip", true)?,
        }))
    }

    fn episode_bounds(rows: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
        let dim = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut low = vec![f64::INFINITY; dim];
        let mut high = vec![f64::NEG_INFINITY; dim];
        for row in rows {
            for (d, v) in row.iter().enumerate().filter(|(_, v)| v.is_finite()) {
                low[d] = low[d].min(*v);
                high[d] = high[d].max(*v);
            }
        }
        for d in 0..dim {
            if !low[d].is_finite() || !high[d].is_finite() {
                low[d] = -1.0;
                high[d] = 1.0;
            } else if high[d] - low[d] < MIN_RANGE {
                // Constant dimension: centre it so it maps to zero.
                let mid = (low[d] + high[d]) / 2.0;
                low[d] = mid - 1.0;
                high[d] = mid + 1.0;
            }
        }
        (low, high)
    }
}

impl Transform for NormalizeActions {
    fn name(&self) -> &'static str {
        NORMALIZE_ACTIONS
    }

    fn apply(&self, mut episode: Episode, _ctx: &TransformContext<'_>) -> Result<Episode, TransformError> {
        let mut rows = Vec::with_capacity(episode.steps.len());
        for (i, step) in episode.steps.iter().enumerate() {
            if let Some(action) = &step.action {
                rows.push((i, action_values(&episode, i, action)?));
            }
        }
        if rows.is_empty() {
            return Ok(episode);
        }

        let (low, high) = match (&self.low, &self.high) {
            (Some(low), Some(high)) => (low.clone(), high.clone()),
            _ => {
                let values: Vec<Vec<f64>> = rows.iter().map(|(_, v)| v.clone()).collect();
                Self::episode_bounds(&values)
            }
        };
        let normalization = ActionNormalization {
            method: "min_max".to_string(),
            low,
            high,
            clip: self.clip,
        };

        for (i, values) in rows {
            #[allow(clippy::cast_possible_truncation)]
            let normalized: Vec<f32> = normalization
                .normalize(&values)
                .into_iter()
                .map(|v| v as f32)
                .collect();
            episode.steps[i].action = Some(Tensor::vector_f32(normalized));
        }
        let recorded = serde_json::to_value(&normalization).map_err(|e| TransformError::MalformedTensor {
            key: "action".to_string(),
            reason: e.to_string(),
        })?;
        episode
            .episode_metadata
            .insert(NORMALIZATION_METADATA_KEY.to_string(), recorded);
        Ok(episode)
    }
}

/// Pads (or truncates) every action to `target_dim` float32 values.
#[derive(Debug, Clone)]
pub struct PadAction {
    target_dim: usize,
    pad_value: f64,
}

impl PadAction {
    /// # Errors
    ///
    /// Rejects a zero `target_dim` or a non-numeric `pad_value`.
    pub fn build(params: &Params) -> Result<Box<dyn Transform>, TransformError> {
        let reader = ParamReader::new(PAD_ACTION, params, &["target_dim", "pad_value"])?;
        Ok(Box::new(Self {
            target_dim: reader.positive_usize("target_dim")?.unwrap_or(7),
            pad_value: reader.number("pad_value")?.unwrap_or(0.0),
        }))
    }
}

impl Transform for PadAction {
    fn name(&self) -> &'static str {
        PAD_ACTION
    }

    fn apply(&self, mut episode: Episode, _ctx: &TransformContext<'_>) -> Result<Episode, TransformError> {
        for i in 0..episode.steps.len() {
            let Some(action) = &episode.steps[i].action else {
                continue;
            };
            let mut values = action_values(&episode, i, action)?;
            values.resize(self.target_dim, self.pad_value);
            #[allow(clippy::cast_possible_truncation)]
            let padded = values.into_iter().map(|v| v as f32).collect();
            episode.steps[i].action = Some(Tensor::vector_f32(padded));
        }
        Ok(episode)
    }
}

#[cfg(test)]
mod tests {
    use datakit_types::episode::Step;
    use datakit_types::spec::DatasetSpec;
    use datakit_types::tensor::TensorData;
    use serde_json::json;

    use super::*;
    use crate::cancel::CancelToken;

    fn episode(actions: &[Vec<f32>]) -> Episode {
        let mut ep = Episode::new("ep", "ds");
        for (i, a) in actions.iter().enumerate() {
            let mut step = Step::new(false, false, f64::from(u32::try_from(i).unwrap()));
            step.action = Some(Tensor::vector_f32(a.clone()));
            ep.steps.push(step);
        }
        ep.mark_boundaries();
        ep
    }

    fn run(build: super::super::TransformFactory, params: serde_json::Value, ep: Episode) -> Episode {
        let transform = build(params.as_object().unwrap()).unwrap();
        let spec = DatasetSpec::new("ds", "Dataset");
        let cancel = CancelToken::new();
        transform
            .apply(ep, &TransformContext { spec: &spec, cancel: &cancel })
            .unwrap()
    }

    fn floats(t: &Tensor) -> Vec<f32> {
        match &t.data {
            TensorData::Float32(v) => v.clone(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_normalize_with_episode_bounds() {
        let ep = episode(&[vec![0.0, 5.0], vec![10.0, 5.0], vec![5.0, 5.0]]);
        let out = run(NormalizeActions::build, json!({}), ep);
        assert_eq!(floats(out.steps[0].action.as_ref().unwrap()), vec![-1.0, 0.0]);
        assert_eq!(floats(out.steps[1].action.as_ref().unwrap()), vec![1.0, 0.0]);
        assert_eq!(floats(out.steps[2].action.as_ref().unwrap()), vec![0.0, 0.0]);

        let recorded = ActionNormalization::from_episode(&out).unwrap();
        assert_eq!(recorded.low, vec![0.0, 4.0]);
        assert_eq!(recorded.high, vec![10.0, 6.0]);
    }

    #[test]
    fn test_normalize_then_denormalize() {
        let ep = episode(&[vec![-2.0], vec![3.0]]);
        let out = run(NormalizeActions::build, json!({"low": -4.0, "high": 4.0}), ep);
        let recorded = ActionNormalization::from_episode(&out).unwrap();
        let normalized = out.steps[1].action.as_ref().unwrap().to_f64_vec().unwrap();
        let restored = recorded.denormalize(&normalized);
        assert!((restored[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_clips() {
        let ep = episode(&[vec![8.0]]);
        let out = run(NormalizeActions::build, json!({"low": [0.0], "high": [4.0]}), ep);
        assert_eq!(floats(out.steps[0].action.as_ref().unwrap()), vec![1.0]);
    }

    #[test]
    fn test_normalize_bad_bounds() {
        assert!(NormalizeActions::build(json!({"low": 1.0}).as_object().unwrap()).is_err());
        assert!(NormalizeActions::build(json!({"low": 1.0, "high": 1.0}).as_object().unwrap()).is_err());
    }

    #[test]
    fn test_pad_and_truncate() {
        let ep = episode(&[vec![1.0, 2.0], vec![1.0, 2.0, 3.0, 4.0]]);
        let out = run(PadAction::build, json!({"target_dim": 3, "pad_value": -1.0}), ep);
        assert_eq!(floats(out.steps[0].action.as_ref().unwrap()), vec![1.0, 2.0, -1.0]);
        assert_eq!(floats(out.steps[1].action.as_ref().unwrap()), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_pad_skips_missing_actions() {
        let mut ep = episode(&[vec![1.0]]);
        ep.steps[0].action = None;
        let out = run(PadAction::build, json!({}), ep);
        assert!(out.steps[0].action.is_none());
    }
}
