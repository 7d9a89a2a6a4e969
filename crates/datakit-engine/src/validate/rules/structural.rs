//! RLDS structural invariants. Any hit makes the episode unusable.

use std::collections::BTreeSet;

use datakit_types::episode::Episode;
use datakit_types::spec::FeatureSpec;
use datakit_types::tensor::Tensor;

use crate::validate::{Hit, RuleContext};

pub fn empty_episode(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    if episode.steps.is_empty() {
        vec![Hit::episode("episode has no steps").field("steps")]
    } else {
        Vec::new()
    }
}

pub fn first_flag(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    match episode.steps.first() {
        Some(step) if !step.is_first => {
            vec![Hit::step(0, "step 0 is not marked is_first").field("is_first")]
        }
        _ => Vec::new(),
    }
}

pub fn last_flag(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    let last = episode.steps.len().saturating_sub(1);
    match episode.steps.last() {
        Some(step) if !step.is_last => {
            vec![Hit::step(last, format!("final step {last} is not marked is_last")).field("is_last")]
        }
        _ => Vec::new(),
    }
}

pub fn stray_first(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    episode
        .steps
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, step)| step.is_first)
        .map(|(i, _)| Hit::step(i, format!("step {i} is marked is_first")).field("is_first"))
        .collect()
}

pub fn stray_last(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    let last = episode.steps.len().saturating_sub(1);
    episode
        .steps
        .iter()
        .enumerate()
        .take(last)
        .filter(|(_, step)| step.is_last)
        .map(|(i, _)| Hit::step(i, format!("step {i} is marked is_last")).field("is_last"))
        .collect()
}

/// Key set of every step must equal step 0's, and include every declared key.
pub fn key_set(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    let Some(first) = episode.steps.first() else {
        return Vec::new();
    };
    let reference: BTreeSet<&str> = first.observation.keys().map(String::as_str).collect();
    let mut hits = Vec::new();

    for declared in ctx.spec.observation_schema.keys() {
        if !reference.contains(declared.as_str()) {
            hits.push(
                Hit::step(0, format!("declared observation '{declared}' is missing"))
                    .field(declared.clone()),
            );
        }
    }

    for (i, step) in episode.steps.iter().enumerate().skip(1) {
        let keys: BTreeSet<&str> = step.observation.keys().map(String::as_str).collect();
        if keys == reference {
            continue;
        }
        let missing: Vec<&str> = reference.difference(&keys).copied().collect();
        let extra: Vec<&str> = keys.difference(&reference).copied().collect();
        hits.push(
            Hit::step(
                i,
                format!("observation keys differ from step 0 (missing {missing:?}, extra {extra:?})"),
            )
            .field("observation")
            .value(serde_json::json!({ "missing": missing, "extra": extra })),
        );
    }
    hits
}

/// Per key, dtype and shape must match step 0 (wildcard dims excepted) and
/// the declared schema when one exists. Reports the first offending step.
pub fn dtype_shape(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    let Some(first) = episode.steps.first() else {
        return Vec::new();
    };
    let mut hits = Vec::new();

    for (key, reference) in &first.observation {
        let declared = ctx.spec.observation_schema.get(key);
        if let Some(spec) = declared {
            if !spec.accepts(reference) {
                hits.push(schema_hit(0, key, reference, spec));
                continue;
            }
        }
        let offender = episode.steps.iter().enumerate().skip(1).find_map(|(i, step)| {
            let tensor = step.observation.get(key)?;
            (!consistent(reference, tensor, declared)).then_some((i, tensor))
        });
        if let Some((i, tensor)) = offender {
            hits.push(drift_hit(i, key, reference, tensor));
        }
    }

    let first_action = episode
        .steps
        .iter()
        .enumerate()
        .find_map(|(i, step)| step.action.as_ref().map(|a| (i, a)));
    if let Some((start, reference)) = first_action {
        let declared = ctx.spec.action_schema.as_ref();
        if let Some(spec) = declared.filter(|spec| !spec.accepts(reference)) {
            hits.push(schema_hit(start, "action", reference, spec));
        } else {
            let offender = episode.steps.iter().enumerate().skip(start + 1).find_map(|(i, step)| {
                let tensor = step.action.as_ref()?;
                (!consistent(reference, tensor, declared)).then_some((i, tensor))
            });
            if let Some((i, tensor)) = offender {
                hits.push(drift_hit(i, "action", reference, tensor));
            }
        }
    }
    hits
}

fn consistent(reference: &Tensor, tensor: &Tensor, declared: Option<&FeatureSpec>) -> bool {
    if tensor.dtype() != reference.dtype() {
        return false;
    }
    match declared {
        // Declared wildcard dims may vary step to step.
        Some(spec) => spec.shape_matches(&tensor.shape),
        None => tensor.shape == reference.shape,
    }
}

fn schema_hit(step: usize, key: &str, tensor: &Tensor, spec: &FeatureSpec) -> Hit {
    Hit::step(
        step,
        format!(
            "'{key}' is {}{:?}, schema declares {}{:?}",
            tensor.dtype(),
            tensor.shape,
            spec.dtype,
            spec.shape
        ),
    )
    .field(key)
}

fn drift_hit(step: usize, key: &str, reference: &Tensor, tensor: &Tensor) -> Hit {
    Hit::step(
        step,
        format!(
            "'{key}' changed from {}{:?} to {}{:?}",
            reference.dtype(),
            reference.shape,
            tensor.dtype(),
            tensor.shape
        ),
    )
    .field(key)
}

#[cfg(test)]
mod tests {
    use datakit_types::spec::DatasetSpec;
    use datakit_types::tensor::DType;

    use super::*;
    use crate::config::types::ValidationConfig;
    use crate::validate::rules::test_support::{check, check_with_spec, episode};

    #[test]
    fn test_empty_episode() {
        let ep = episode(0);
        assert_eq!(check(empty_episode, &ep, &ValidationConfig::default()).len(), 1);
        assert!(check(first_flag, &ep, &ValidationConfig::default()).is_empty());
        assert!(check(last_flag, &ep, &ValidationConfig::default()).is_empty());
    }

    #[test]
    fn test_boundary_flags() {
        let mut ep = episode(4);
        ep.steps[0].is_first = false;
        ep.steps[2].is_first = true;
        ep.steps[3].is_last = false;
        ep.steps[1].is_last = true;
        let config = ValidationConfig::default();
        assert_eq!(check(first_flag, &ep, &config)[0].step_index, Some(0));
        assert_eq!(check(last_flag, &ep, &config)[0].step_index, Some(3));
        assert_eq!(check(stray_first, &ep, &config)[0].step_index, Some(2));
        assert_eq!(check(stray_last, &ep, &config)[0].step_index, Some(1));
    }

    #[test]
    fn test_single_step_episode_is_first_and_last() {
        let ep = episode(1);
        let config = ValidationConfig::default();
        assert!(check(first_flag, &ep, &config).is_empty());
        assert!(check(last_flag, &ep, &config).is_empty());
        assert!(check(stray_first, &ep, &config).is_empty());
        assert!(check(stray_last, &ep, &config).is_empty());
    }

    #[test]
    fn test_key_set_drift() {
        let mut ep = episode(3);
        ep.steps[2]
            .observation
            .insert("observation.extra".into(), Tensor::scalar_f64(1.0));
        let hits = check(key_set, &ep, &ValidationConfig::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].step_index, Some(2));
        assert_eq!(hits[0].value.as_ref().unwrap()["extra"][0], "observation.extra");
    }

    #[test]
    fn test_declared_key_missing() {
        let mut spec = DatasetSpec::new("ds", "Dataset");
        spec.observation_schema.insert(
            "observation.images.front".into(),
            FeatureSpec::new(DType::Uint8, &[2, 2, 3]),
        );
        let hits = check_with_spec(key_set, &episode(2), &spec);
        assert_eq!(hits[0].field.as_deref(), Some("observation.images.front"));
    }

    #[test]
    fn test_shape_drift_reports_first_offender() {
        let mut ep = episode(4);
        ep.steps[2].action = Some(Tensor::vector_f32(vec![0.0; 6]));
        ep.steps[3].action = Some(Tensor::vector_f32(vec![0.0; 5]));
        let hits = check(dtype_shape, &ep, &ValidationConfig::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].step_index, Some(2));
        assert_eq!(hits[0].field.as_deref(), Some("action"));
    }

    #[test]
    fn test_wildcard_dimension_may_vary() {
        let mut spec = DatasetSpec::new("ds", "Dataset");
        let mut feature = FeatureSpec::new(DType::Float32, &[0]);
        feature.shape = vec![None];
        spec.observation_schema
            .insert("observation.state".into(), feature);
        let mut ep = episode(3);
        ep.steps[1]
            .observation
            .insert("observation.state".into(), Tensor::vector_f32(vec![1.0; 5]));
        assert!(check_with_spec(dtype_shape, &ep, &spec).is_empty());
    }

    #[test]
    fn test_schema_mismatch() {
        let mut spec = DatasetSpec::new("ds", "Dataset");
        spec.observation_schema.insert(
            "observation.state".into(),
            FeatureSpec::new(DType::Float64, &[3]),
        );
        let hits = check_with_spec(dtype_shape, &episode(2), &spec);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].step_index, Some(0));
    }
}
