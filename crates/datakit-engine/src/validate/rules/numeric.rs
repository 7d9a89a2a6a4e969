//! NaN/Inf, bounds and outlier checks on actions and observations.
//!
//! Each rule reports once per episode (or once per key) with the first
//! offending step and a count, so a long broken episode does not flood the
//! report.

use datakit_types::episode::Episode;

use crate::validate::{Hit, RuleContext};

pub fn non_finite_action(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    let offenders: Vec<usize> = episode
        .steps
        .iter()
        .enumerate()
        .filter(|(_, step)| step.action.as_ref().is_some_and(|a| !a.is_finite()))
        .map(|(i, _)| i)
        .collect();
    match offenders.first() {
        Some(&first) => vec![Hit::step(
            first,
            format!("{} step(s) have non-finite action values", offenders.len()),
        )
        .field("action")
        .value(offenders.len())],
        None => Vec::new(),
    }
}

pub fn non_finite_observation(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    let Some(first) = episode.steps.first() else {
        return Vec::new();
    };
    let mut hits = Vec::new();
    for key in first.observation.keys() {
        let offenders: Vec<usize> = episode
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.observation.get(key).is_some_and(|t| !t.is_finite()))
            .map(|(i, _)| i)
            .collect();
        if let Some(&step) = offenders.first() {
            hits.push(
                Hit::step(step, format!("{} step(s) have non-finite '{key}'", offenders.len()))
                    .field(key.clone())
                    .value(offenders.len()),
            );
        }
    }
    hits
}

pub fn action_bounds(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    let [low, high] = ctx.config.action_bounds;
    let mut first = None;
    let mut worst = 0.0_f64;
    for (i, step) in episode.steps.iter().enumerate() {
        let Some(values) = step.action.as_ref().and_then(|a| a.to_f64_vec()) else {
            continue;
        };
        for v in values.into_iter().filter(|v| v.is_finite()) {
            if v < low || v > high {
                first.get_or_insert(i);
                if v.abs() > worst.abs() {
                    worst = v;
                }
            }
        }
    }
    match first {
        Some(step) => vec![Hit::step(
            step,
            format!("action value {worst} outside [{low}, {high}]"),
        )
        .field("action")
        .value(worst)],
        None => Vec::new(),
    }
}

/// Per-dimension z-score over the episode.
pub fn action_outlier(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    let rows: Vec<(usize, Vec<f64>)> = episode
        .steps
        .iter()
        .enumerate()
        .filter_map(|(i, step)| step.action.as_ref()?.to_f64_vec().map(|v| (i, v)))
        .collect();
    let Some(dim) = rows.first().map(|(_, v)| v.len()) else {
        return Vec::new();
    };
    if rows.len() < 3 || rows.iter().any(|(_, v)| v.len() != dim) {
        return Vec::new();
    }

    let threshold = ctx.config.action_sigma_threshold;
    #[allow(clippy::cast_precision_loss)]
    let n = rows.len() as f64;
    let mut hits = Vec::new();
    for d in 0..dim {
        let column: Vec<f64> = rows.iter().map(|(_, v)| v[d]).collect();
        if column.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let mean = column.iter().sum::<f64>() / n;
        let std = (column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if std <= f64::EPSILON {
            continue;
        }
        let outlier = rows
            .iter()
            .map(|(i, v)| (*i, (v[d] - mean).abs() / std))
            .find(|(_, z)| *z > threshold);
        if let Some((step, z)) = outlier {
            hits.push(
                Hit::step(step, format!("action[{d}] z-score {z:.2} exceeds {threshold}"))
                    .field(format!("action[{d}]"))
                    .value(z),
            );
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use datakit_types::tensor::Tensor;

    use super::*;
    use crate::config::types::ValidationConfig;
    use crate::validate::rules::test_support::{check, episode};

    #[test]
    fn test_nan_action_reported_once() {
        let mut ep = episode(4);
        ep.steps[1].action = Some(Tensor::vector_f32(vec![f32::NAN; 7]));
        ep.steps[3].action = Some(Tensor::vector_f32(vec![f32::INFINITY; 7]));
        let hits = check(non_finite_action, &ep, &ValidationConfig::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].step_index, Some(1));
        assert_eq!(hits[0].value, Some(2.into()));
    }

    #[test]
    fn test_nan_observation_per_key() {
        let mut ep = episode(3);
        ep.steps[2]
            .observation
            .insert("observation.state".into(), Tensor::vector_f32(vec![f32::NAN; 3]));
        let hits = check(non_finite_observation, &ep, &ValidationConfig::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].field.as_deref(), Some("observation.state"));
    }

    #[test]
    fn test_bounds_report_worst_value() {
        let mut ep = episode(3);
        ep.steps[0].action = Some(Tensor::vector_f32(vec![11.0, 0.0]));
        ep.steps[1].action = Some(Tensor::vector_f32(vec![-20.0, 0.0]));
        let hits = check(action_bounds, &ep, &ValidationConfig::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].step_index, Some(0));
        assert_eq!(hits[0].value, Some((-20.0).into()));
    }

    #[test]
    fn test_outlier_detection() {
        let mut ep = episode(30);
        for (i, step) in ep.steps.iter_mut().enumerate() {
            let v = if i == 17 { 50.0 } else { 0.1 * f32::from(u8::try_from(i % 3).unwrap()) };
            step.action = Some(Tensor::vector_f32(vec![v]));
        }
        let config = ValidationConfig {
            action_sigma_threshold: 4.0,
            ..ValidationConfig::default()
        };
        let hits = check(action_outlier, &ep, &config);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].step_index, Some(17));
    }

    #[test]
    fn test_constant_actions_are_not_outliers() {
        let ep = episode(10);
        assert!(check(action_outlier, &ep, &ValidationConfig::default()).is_empty());
    }
}
