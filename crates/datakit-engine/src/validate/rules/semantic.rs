//! Episode-level consistency: length, task text, terminal flags.

use datakit_types::episode::Episode;

use crate::validate::{Hit, RuleContext};

pub fn too_short(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    let n = episode.num_steps();
    // Empty episodes are reported structurally.
    if n > 0 && n < ctx.config.min_episode_length {
        vec![Hit::episode(format!(
            "episode has {n} steps, minimum is {}",
            ctx.config.min_episode_length
        ))
        .field("num_steps")
        .value(n)]
    } else {
        Vec::new()
    }
}

pub fn too_long(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    let n = episode.num_steps();
    if n > ctx.config.max_episode_length {
        vec![Hit::episode(format!(
            "episode has {n} steps, maximum is {}",
            ctx.config.max_episode_length
        ))
        .field("num_steps")
        .value(n)]
    } else {
        Vec::new()
    }
}

pub fn empty_task(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    if episode.task_text.trim().is_empty() {
        vec![Hit::episode("task text is empty").field("task_text")]
    } else {
        Vec::new()
    }
}

pub fn early_terminal(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    let last = episode.steps.len().saturating_sub(1);
    episode
        .steps
        .iter()
        .enumerate()
        .take(last)
        .filter(|(_, step)| step.is_terminal)
        .map(|(i, _)| Hit::step(i, format!("step {i} is terminal but not final")).field("is_terminal"))
        .collect()
}

/// RLDS leaves the final action undefined.
pub fn final_action(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    match episode.steps.last() {
        Some(step) if step.action.is_some() => {
            let last = episode.steps.len() - 1;
            vec![Hit::step(last, "final step carries an action").field("action")]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ValidationConfig;
    use crate::validate::rules::test_support::{check, episode};

    #[test]
    fn test_length_bounds() {
        let config = ValidationConfig {
            min_episode_length: 3,
            max_episode_length: 5,
            ..ValidationConfig::default()
        };
        assert_eq!(check(too_short, &episode(2), &config).len(), 1);
        assert!(check(too_short, &episode(3), &config).is_empty());
        assert!(check(too_short, &episode(0), &config).is_empty());
        assert_eq!(check(too_long, &episode(6), &config)[0].value, Some(6.into()));
        assert!(check(too_long, &episode(5), &config).is_empty());
    }

    #[test]
    fn test_blank_task_text() {
        let mut ep = episode(2);
        ep.task_text = "   ".into();
        assert_eq!(check(empty_task, &ep, &ValidationConfig::default()).len(), 1);
    }

    #[test]
    fn test_terminal_flags() {
        let mut ep = episode(3);
        ep.steps[1].is_terminal = true;
        ep.steps[2].is_terminal = true;
        let hits = check(early_terminal, &ep, &ValidationConfig::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].step_index, Some(1));
    }

    #[test]
    fn test_final_action() {
        let mut ep = episode(3);
        assert_eq!(check(final_action, &ep, &ValidationConfig::default()).len(), 1);
        ep.steps[2].action = None;
        assert!(check(final_action, &ep, &ValidationConfig::default()).is_empty());
    }
}
