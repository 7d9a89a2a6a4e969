//! Image observation checks. A key is an image if it uses the camera prefix
//! or is declared as video in the schema.

use datakit_types::episode::{Episode, IMAGE_PREFIX};
use datakit_types::tensor::{DType, Tensor, TensorData};

use crate::validate::{Hit, RuleContext};

fn image_keys<'a>(episode: &'a Episode, ctx: &RuleContext<'_>) -> Vec<&'a str> {
    episode
        .steps
        .first()
        .map(|step| {
            step.observation
                .keys()
                .map(String::as_str)
                .filter(|key| key.starts_with(IMAGE_PREFIX) || ctx.spec.is_video_key(key))
                .collect()
        })
        .unwrap_or_default()
}

fn first_offender<'a>(
    episode: &'a Episode,
    key: &str,
    bad: impl Fn(&Tensor) -> bool,
) -> Option<(usize, &'a Tensor, usize)> {
    let mut first = None;
    let mut count = 0;
    for (i, step) in episode.steps.iter().enumerate() {
        if let Some(tensor) = step.observation.get(key).filter(|t| bad(*t)) {
            count += 1;
            first.get_or_insert((i, tensor));
        }
    }
    first.map(|(i, t)| (i, t, count))
}

pub fn image_dtype(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    image_keys(episode, ctx)
        .into_iter()
        .filter_map(|key| {
            let (step, tensor, count) = first_offender(episode, key, |t| t.dtype() != DType::Uint8)?;
            Some(
                Hit::step(
                    step,
                    format!("'{key}' has dtype {} in {count} frame(s), expected uint8", tensor.dtype()),
                )
                .field(key)
                .value(tensor.dtype().as_str()),
            )
        })
        .collect()
}

fn bad_shape(tensor: &Tensor) -> bool {
    match tensor.shape.as_slice() {
        [h, w] => *h == 0 || *w == 0,
        [h, w, c] => *h == 0 || *w == 0 || !matches!(c, 1 | 3 | 4),
        _ => true,
    }
}

pub fn image_shape(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    image_keys(episode, ctx)
        .into_iter()
        .filter_map(|key| {
            let (step, tensor, _) = first_offender(episode, key, bad_shape)?;
            Some(
                Hit::step(step, format!("'{key}' has unusable image shape {:?}", tensor.shape))
                    .field(key)
                    .value(tensor.shape.clone()),
            )
        })
        .collect()
}

fn is_blank(tensor: &Tensor) -> bool {
    match &tensor.data {
        TensorData::Uint8(pixels) => pixels
            .first()
            .is_some_and(|first| pixels.iter().all(|p| p == first)),
        _ => false,
    }
}

pub fn blank_frame(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    image_keys(episode, ctx)
        .into_iter()
        .filter_map(|key| {
            let (step, _, count) = first_offender(episode, key, is_blank)?;
            Some(
                Hit::step(step, format!("'{key}' has {count} constant frame(s)"))
                    .field(key)
                    .value(count),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ValidationConfig;
    use crate::validate::rules::test_support::{check, episode};

    fn with_image(n: usize, make: impl Fn(usize) -> Tensor) -> Episode {
        let mut ep = episode(n);
        for (i, step) in ep.steps.iter_mut().enumerate() {
            step.observation
                .insert("observation.images.front".into(), make(i));
        }
        ep
    }

    fn gradient(h: usize, w: usize, c: usize) -> Tensor {
        let pixels = (0..h * w * c).map(|i| u8::try_from(i % 251).unwrap()).collect();
        Tensor::image(h, w, c, pixels).unwrap()
    }

    #[test]
    fn test_clean_images() {
        let ep = with_image(3, |_| gradient(4, 4, 3));
        let config = ValidationConfig::default();
        assert!(check(image_dtype, &ep, &config).is_empty());
        assert!(check(image_shape, &ep, &config).is_empty());
        assert!(check(blank_frame, &ep, &config).is_empty());
    }

    #[test]
    fn test_float_image() {
        let ep = with_image(2, |_| Tensor::new(vec![2, 2, 3], TensorData::Float32(vec![0.5; 12])).unwrap());
        let hits = check(image_dtype, &ep, &ValidationConfig::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, Some("float32".into()));
    }

    #[test]
    fn test_bad_channel_count() {
        let ep = with_image(2, |i| if i == 1 { gradient(2, 2, 2) } else { gradient(2, 2, 3) });
        let hits = check(image_shape, &ep, &ValidationConfig::default());
        assert_eq!(hits[0].step_index, Some(1));
    }

    #[test]
    fn test_blank_frames_counted() {
        let ep = with_image(3, |i| {
            if i == 0 {
                gradient(2, 2, 1)
            } else {
                Tensor::image(2, 2, 1, vec![0; 4]).unwrap()
            }
        });
        let hits = check(blank_frame, &ep, &ValidationConfig::default());
        assert_eq!(hits[0].step_index, Some(1));
        assert_eq!(hits[0].value, Some(2.into()));
    }
}
