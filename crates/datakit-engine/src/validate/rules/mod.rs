//! Built-in rule table.

mod media;
mod metadata;
mod numeric;
mod semantic;
mod structural;
mod temporal;

use datakit_types::finding::{RuleCategory, Severity};

use super::RuleDef;

fn rule(
    code: &'static str,
    category: RuleCategory,
    default_severity: Severity,
    description: &'static str,
    check: super::CheckFn,
) -> RuleDef {
    RuleDef {
        code,
        category,
        default_severity,
        optional: false,
        description,
        check,
    }
}

fn may(mut def: RuleDef) -> RuleDef {
    def.optional = true;
    def
}

/// Every built-in rule, in code order.
#[must_use]
pub fn builtin_rules() -> Vec<RuleDef> {
    use RuleCategory::{Media, Metadata, Numeric, Semantic, Structural, Temporal};
    use Severity::{Error, Info, Warn};

    vec![
        rule("S001", Structural, Error, "episode has no steps", structural::empty_episode),
        rule("S002", Structural, Error, "first step is not marked is_first", structural::first_flag),
        rule("S003", Structural, Error, "last step is not marked is_last", structural::last_flag),
        rule("S004", Structural, Error, "is_first set on a non-initial step", structural::stray_first),
        rule("S005", Structural, Error, "is_last set on a non-final step", structural::stray_last),
        rule("S006", Structural, Error, "observation keys differ between steps", structural::key_set),
        rule("S007", Structural, Error, "dtype or shape differs between steps or from schema", structural::dtype_shape),
        rule("M101", Semantic, Warn, "episode shorter than min_episode_length", semantic::too_short),
        rule("M102", Semantic, Warn, "episode longer than max_episode_length", semantic::too_long),
        rule("M103", Semantic, Warn, "task text is empty", semantic::empty_task),
        rule("M104", Semantic, Warn, "is_terminal set on a non-final step", semantic::early_terminal),
        rule("M105", Semantic, Info, "action present on the final step", semantic::final_action),
        rule("N201", Numeric, Warn, "non-finite action values", numeric::non_finite_action),
        rule("N202", Numeric, Warn, "non-finite observation values", numeric::non_finite_observation),
        rule("N203", Numeric, Warn, "action outside configured bounds", numeric::action_bounds),
        may(rule("N204", Numeric, Info, "action z-score outlier", numeric::action_outlier)),
        rule("T301", Temporal, Warn, "timestamps not strictly increasing", temporal::monotonic),
        rule("T302", Temporal, Info, "timestamp gap larger than expected", temporal::gaps),
        may(rule("T303", Temporal, Info, "first timestamp is not zero", temporal::origin)),
        rule("V401", Media, Warn, "image dtype is not uint8", media::image_dtype),
        rule("V402", Media, Warn, "image has bad channel count or a zero dimension", media::image_shape),
        may(rule("V403", Media, Info, "constant (blank) image frame", media::blank_frame)),
        rule("D501", Metadata, Warn, "episode metadata lacks robot_id", metadata::robot_id),
        rule("D502", Metadata, Warn, "dataset_id differs from the dataset spec", metadata::dataset_id),
        rule("D503", Metadata, Warn, "action dimension differs from the action space type", metadata::action_dim),
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    use datakit_types::episode::{Episode, Step};
    use datakit_types::spec::DatasetSpec;
    use datakit_types::tensor::Tensor;

    use crate::config::types::ValidationConfig;
    use crate::validate::{Hit, RuleContext};

    pub fn episode(n: usize) -> Episode {
        let mut ep = Episode::new("ep", "ds");
        ep.task_text = "stack blocks".into();
        ep.episode_metadata
            .insert("robot_id".into(), serde_json::json!("widowx"));
        for i in 0..n {
            let mut step = Step::new(false, false, f64::from(u32::try_from(i).unwrap()) * 0.1);
            step.action = Some(Tensor::vector_f32(vec![0.0; 7]));
            step.observation
                .insert("observation.state".into(), Tensor::vector_f32(vec![1.0; 3]));
            ep.steps.push(step);
        }
        ep.mark_boundaries();
        ep
    }

    pub fn check(
        f: fn(&Episode, &RuleContext<'_>) -> Vec<Hit>,
        episode: &Episode,
        config: &ValidationConfig,
    ) -> Vec<Hit> {
        let spec = DatasetSpec::new("ds", "Dataset");
        f(episode, &RuleContext { spec: &spec, config })
    }

    pub fn check_with_spec(
        f: fn(&Episode, &RuleContext<'_>) -> Vec<Hit>,
        episode: &Episode,
        spec: &DatasetSpec,
    ) -> Vec<Hit> {
        let config = ValidationConfig::default();
        f(episode, &RuleContext { spec, config: &config })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let rules = builtin_rules();
        let codes: HashSet<&str> = rules.iter().map(|r| r.code).collect();
        assert_eq!(codes.len(), rules.len());
    }

    #[test]
    fn test_structural_rules_default_to_error() {
        for rule in builtin_rules() {
            if rule.category == RuleCategory::Structural {
                assert_eq!(rule.default_severity, Severity::Error, "{}", rule.code);
            }
        }
    }

    #[test]
    fn test_optional_rules_are_informational() {
        for rule in builtin_rules().into_iter().filter(|r| r.optional) {
            assert_eq!(rule.default_severity, Severity::Info, "{}", rule.code);
        }
    }
}
