use datakit_types::episode::{Episode, CANONICAL_IMAGE_KEY, IMAGE_PREFIX};

use super::{ParamReader, Params, Transform, TransformContext, TransformError};

pub const SELECT_CAMERA: &str = "select_camera";

const DEFAULT_FALLBACK: [&str; 4] = ["front", "workspace", "overhead", "wrist"];

/// Copies one camera view to `observation.images.canonical`.
///
/// With no explicit camera, the first match in the fallback order wins,
/// then the alphabetically first camera. Episodes without any camera pass
/// through unchanged.
#[derive(Debug, Clone)]
pub struct SelectCamera {
    camera: Option<String>,
    fallback_order: Vec<String>,
    target_key: String,
    drop_others: bool,
}

impl SelectCamera {
    /// # Errors
    ///
    /// Rejects unknown or mistyped parameters.
    pub fn build(params: &Params) -> Result<Box<dyn Transform>, TransformError> {
        let reader = ParamReader::new(
            SELECT_CAMERA,
            params,
            &["camera", "fallback_order", "target_key", "drop_others"],
        )?;
        let target_key = reader
            .string("target_key")?
            .unwrap_or_else(|| CANONICAL_IMAGE_KEY.to_string());
        if !target_key.starts_with(IMAGE_PREFIX) {
            return Err(reader.invalid("target_key", format!("must start with '{IMAGE_PREFIX}'")));
        }
        Ok(Box::new(Self {
            camera: reader.string("camera")?,
            fallback_order: reader
                .strings("fallback_order")?
                .unwrap_or_else(|| DEFAULT_FALLBACK.iter().map(|s| (*s).to_string()).collect()),
            target_key,
            drop_others: reader.boolean("drop_others", false)?,
        }))
    }

    fn choose(&self, available: &[String]) -> Result<Option<String>, TransformError> {
        if let Some(camera) = &self.camera {
            if available.contains(camera) {
                return Ok(Some(camera.clone()));
            }
            return Err(TransformError::CameraNotFound {
                camera: camera.clone(),
                available: available.to_vec(),
            });
        }
        let preferred = self
            .fallback_order
            .iter()
            .find(|cam| available.contains(*cam))
            .or_else(|| available.first());
        Ok(preferred.cloned())
    }
}

impl Transform for SelectCamera {
    fn name(&self) -> &'static str {
        SELECT_CAMERA
    }

    fn apply(&self, mut episode: Episode, _ctx: &TransformContext<'_>) -> Result<Episode, TransformError> {
        let target_camera = self.target_key.trim_start_matches(IMAGE_PREFIX);
        let available: Vec<String> = episode
            .cameras()
            .into_iter()
            .filter(|cam| cam != target_camera)
            .collect();
        let Some(camera) = self.choose(&available)? else {
            tracing::debug!(episode_id = %episode.episode_id, "No camera to select");
            return Ok(episode);
        };

        let source_key = format!("{IMAGE_PREFIX}{camera}");
        for step in &mut episode.steps {
            let Some(frame) = step.observation.get(&source_key).cloned() else {
                continue;
            };
            if self.drop_others {
                step.observation.retain(|key, _| !key.starts_with(IMAGE_PREFIX));
            }
            step.observation.insert(self.target_key.clone(), frame);
        }
        episode
            .episode_metadata
            .insert("canonical_camera".to_string(), camera.into());
        Ok(episode)
    }
}

#[cfg(test)]
mod tests {
    use datakit_types::episode::Step;
    use datakit_types::spec::DatasetSpec;
    use datakit_types::tensor::Tensor;
    use serde_json::json;

    use super::*;
    use crate::cancel::CancelToken;

    fn episode(cameras: &[&str]) -> Episode {
        let mut ep = Episode::new("ep", "ds");
        for i in 0..2u8 {
            let mut step = Step::new(false, false, f64::from(i));
            for (c, cam) in cameras.iter().enumerate() {
                let value = u8::try_from(c).unwrap() * 10 + i;
                step.observation.insert(
                    format!("{IMAGE_PREFIX}{cam}"),
                    Tensor::image(1, 1, 3, vec![value; 3]).unwrap(),
                );
            }
            ep.steps.push(step);
        }
        ep.mark_boundaries();
        ep
    }

    fn run(params: serde_json::Value, ep: Episode) -> Result<Episode, TransformError> {
        let transform = SelectCamera::build(params.as_object().unwrap()).unwrap();
        let spec = DatasetSpec::new("ds", "Dataset");
        let cancel = CancelToken::new();
        transform.apply(ep, &TransformContext { spec: &spec, cancel: &cancel })
    }

    #[test]
    fn test_explicit_camera() {
        let out = run(json!({"camera": "wrist"}), episode(&["front", "wrist"])).unwrap();
        let canonical = &out.steps[1].observation[CANONICAL_IMAGE_KEY];
        assert_eq!(canonical, &out.steps[1].observation["observation.images.wrist"]);
        assert_eq!(out.episode_metadata["canonical_camera"], "wrist");
    }

    #[test]
    fn test_missing_camera_fails() {
        let err = run(json!({"camera": "top"}), episode(&["front"])).unwrap_err();
        assert_eq!(
            err,
            TransformError::CameraNotFound {
                camera: "top".into(),
                available: vec!["front".into()],
            }
        );
    }

    #[test]
    fn test_fallback_order() {
        let out = run(json!({}), episode(&["wrist", "overhead", "aaa"])).unwrap();
        assert_eq!(out.episode_metadata["canonical_camera"], "overhead");
        let out = run(json!({}), episode(&["zeta", "beta"])).unwrap();
        assert_eq!(out.episode_metadata["canonical_camera"], "beta");
    }

    #[test]
    fn test_drop_others() {
        let out = run(json!({"drop_others": true}), episode(&["front", "wrist"])).unwrap();
        let keys: Vec<&String> = out.steps[0].observation.keys().collect();
        assert_eq!(keys, vec![CANONICAL_IMAGE_KEY]);
    }

    #[test]
    fn test_no_cameras_is_noop() {
        let ep = episode(&[]);
        let out = run(json!({}), ep.clone()).unwrap();
        assert_eq!(out, ep);
    }

    #[test]
    fn test_bad_target_key() {
        let params = json!({"target_key": "observation.state"});
        assert!(SelectCamera::build(params.as_object().unwrap()).is_err());
    }
}
