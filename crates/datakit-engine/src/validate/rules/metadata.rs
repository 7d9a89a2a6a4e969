use datakit_types::episode::Episode;

use crate::validate::{Hit, RuleContext};

pub fn robot_id(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    match episode.metadata_str("robot_id") {
        Some(id) if !id.trim().is_empty() => Vec::new(),
        _ => vec![Hit::episode("episode metadata has no robot_id").field("episode_metadata.robot_id")],
    }
}

pub fn dataset_id(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    if episode.dataset_id == ctx.spec.dataset_id {
        return Vec::new();
    }
    vec![Hit::episode(format!(
        "episode dataset_id '{}' differs from '{}'",
        episode.dataset_id, ctx.spec.dataset_id
    ))
    .field("dataset_id")
    .value(episode.dataset_id.clone())]
}

pub fn action_dim(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    let Some(expected) = ctx.spec.action_space_type.expected_dim() else {
        return Vec::new();
    };
    let found = episode
        .steps
        .iter()
        .enumerate()
        .find_map(|(i, step)| step.action.as_ref().map(|a| (i, a.len())));
    match found {
        Some((step, len)) if len != expected => vec![Hit::step(
            step,
            format!(
                "action has {len} dims, {} expects {expected}",
                ctx.spec.action_space_type.as_str()
            ),
        )
        .field("action")
        .value(len)],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use datakit_types::spec::{ActionSpaceType, DatasetSpec};
    use datakit_types::tensor::Tensor;

    use super::*;
    use crate::config::types::ValidationConfig;
    use crate::validate::rules::test_support::{check, check_with_spec, episode};

    #[test]
    fn test_missing_robot_id() {
        let mut ep = episode(2);
        assert!(check(robot_id, &ep, &ValidationConfig::default()).is_empty());
        ep.episode_metadata.remove("robot_id");
        assert_eq!(check(robot_id, &ep, &ValidationConfig::default()).len(), 1);
    }

    #[test]
    fn test_dataset_id_mismatch() {
        let mut ep = episode(2);
        ep.dataset_id = "other".into();
        let hits = check(dataset_id, &ep, &ValidationConfig::default());
        assert_eq!(hits[0].value, Some("other".into()));
    }

    #[test]
    fn test_action_dim_against_space() {
        let mut spec = DatasetSpec::new("ds", "Dataset");
        spec.action_space_type = ActionSpaceType::EeDelta7;
        assert!(check_with_spec(action_dim, &episode(2), &spec).is_empty());

        let mut ep = episode(2);
        for step in &mut ep.steps {
            step.action = Some(Tensor::vector_f32(vec![0.0; 6]));
        }
        assert_eq!(check_with_spec(action_dim, &ep, &spec)[0].value, Some(6.into()));
    }
}
