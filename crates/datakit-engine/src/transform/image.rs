use datakit_types::episode::{Episode, IMAGE_PREFIX};
use datakit_types::tensor::{Tensor, TensorData};

use super::{ParamReader, Params, Transform, TransformContext, TransformError};

pub const RESIZE_IMAGES: &str = "resize_images";

/// Nearest-neighbour resize of `uint8` HWC (or HW) images.
///
/// Checks the cancel flag between frames so a fail-fast abort does not wait
/// for a long video episode to finish.
#[derive(Debug, Clone)]
pub struct ResizeImages {
    height: usize,
    width: usize,
    /// Observation keys to resize; all image keys when `None`.
    keys: Option<Vec<String>>,
}

impl ResizeImages {
    /// # Errors
    ///
    /// `height` and `width` are required positive integers.
    pub fn build(params: &Params) -> Result<Box<dyn Transform>, TransformError> {
        let reader = ParamReader::new(RESIZE_IMAGES, params, &["height", "width", "keys"])?;
        let height = reader
            .positive_usize("height")?
            .ok_or_else(|| reader.invalid("height", "required"))?;
        let width = reader
            .positive_usize("width")?
            .ok_or_else(|| reader.invalid("width", "required"))?;
        Ok(Box::new(Self {
            height,
            width,
            keys: reader.strings("keys")?,
        }))
    }

    fn targets(&self, key: &str) -> bool {
        match &self.keys {
            Some(keys) => keys.iter().any(|k| k == key),
            None => key.starts_with(IMAGE_PREFIX),
        }
    }

    fn resize(&self, key: &str, tensor: &Tensor) -> Result<Tensor, TransformError> {
        let TensorData::Uint8(pixels) = &tensor.data else {
            return Err(TransformError::MalformedTensor {
                key: key.to_string(),
                reason: format!("expected uint8 image, got {}", tensor.dtype()),
            });
        };
        let (src_h, src_w, channels) = match tensor.shape.as_slice() {
            [h, w] => (*h, *w, 1),
            [h, w, c] => (*h, *w, *c),
            other => {
                return Err(TransformError::MalformedTensor {
                    key: key.to_string(),
                    reason: format!("expected HW or HWC image, got shape {other:?}"),
                })
            }
        };
        if src_h == 0 || src_w == 0 || channels == 0 {
            return Err(TransformError::MalformedTensor {
                key: key.to_string(),
                reason: format!("zero-sized image {:?}", tensor.shape),
            });
        }
        if src_h == self.height && src_w == self.width {
            return Ok(tensor.clone());
        }

        let mut out = Vec::with_capacity(self.height * self.width * channels);
        for y in 0..self.height {
            let sy = y * src_h / self.height;
            for x in 0..self.width {
                let sx = x * src_w / self.width;
                let offset = (sy * src_w + sx) * channels;
                out.extend_from_slice(&pixels[offset..offset + channels]);
            }
        }
        let shape = if tensor.shape.len() == 2 {
            vec![self.height, self.width]
        } else {
            vec![self.height, self.width, channels]
        };
        Ok(Tensor::new(shape, TensorData::Uint8(out))?)
    }
}

impl Transform for ResizeImages {
    fn name(&self) -> &'static str {
        RESIZE_IMAGES
    }

    fn apply(&self, mut episode: Episode, ctx: &TransformContext<'_>) -> Result<Episode, TransformError> {
        for step in &mut episode.steps {
            if ctx.cancel.is_cancelled() {
                return Err(TransformError::Cancelled);
            }
            for (key, tensor) in &mut step.observation {
                if self.targets(key) {
                    *tensor = self.resize(key, tensor)?;
                }
            }
        }
        Ok(episode)
    }
}
