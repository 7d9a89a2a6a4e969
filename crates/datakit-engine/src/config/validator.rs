//! Semantic validation for parsed compile configuration values.

use anyhow::{bail, Result};

use crate::config::types::{CompileConfig, ExecutionConfig, ShardingConfig, SplitConfig, ValidationConfig};
use crate::context::CompileContext;
use crate::source::Selector;
use crate::validate::SeverityPolicy;

fn validate_thresholds(validation: &ValidationConfig, errors: &mut Vec<String>) {
    if validation.min_episode_length == 0 {
        errors.push("validation.min_episode_length must be at least 1".to_string());
    }
    if validation.max_episode_length < validation.min_episode_length {
        errors.push(format!(
            "validation.max_episode_length ({}) is below min_episode_length ({})",
            validation.max_episode_length, validation.min_episode_length
        ));
    }
    let [low, high] = validation.action_bounds;
    if !low.is_finite() || !high.is_finite() || low >= high {
        errors.push(format!(
            "validation.action_bounds must be finite with low < high, got [{low}, {high}]"
        ));
    }
    if validation.action_sigma_threshold <= 0.0 {
        errors.push("validation.action_sigma_threshold must be > 0".to_string());
    }
    if validation.timestamp_gap_factor <= 0.0 {
        errors.push("validation.timestamp_gap_factor must be > 0".to_string());
    }
    if validation.max_findings_per_code == 0 {
        errors.push("validation.max_findings_per_code must be at least 1".to_string());
    }
    if let Some(ratio) = validation.max_invalid_ratio {
        if !(0.0..=1.0).contains(&ratio) {
            errors.push(format!("validation.max_invalid_ratio must be within [0, 1], got {ratio}"));
        }
    }
}

fn validate_modes(validation: &ValidationConfig, errors: &mut Vec<String>) {
    if !validation.skip_validation {
        return;
    }
    for (flag, set) in [
        ("fail_fast", validation.fail_fast),
        ("quarantine", validation.quarantine),
        ("strict", validation.strict),
    ] {
        if set {
            errors.push(format!("validation.skip_validation cannot be combined with {flag}"));
        }
    }
    if !validation.severity_overrides.is_empty() {
        errors.push("validation.severity_overrides have no effect with skip_validation".to_string());
    }
}

fn validate_sharding(sharding: &ShardingConfig, errors: &mut Vec<String>) {
    if sharding.episodes_per_shard == 0 {
        errors.push("sharding.episodes_per_shard must be at least 1".to_string());
    }
    if sharding.frames_per_shard == 0 {
        errors.push("sharding.frames_per_shard must be at least 1".to_string());
    }
}

fn validate_execution(execution: &ExecutionConfig, errors: &mut Vec<String>) {
    if execution.workers == 0 {
        errors.push("execution.workers must be at least 1".to_string());
    }
    if execution.queue_depth_per_worker == 0 {
        errors.push("execution.queue_depth_per_worker must be at least 1".to_string());
    }
}

fn validate_splits(splits: &SplitConfig, errors: &mut Vec<String>) {
    let in_range = |v: f64| (0.0..=1.0).contains(&v);
    if !in_range(splits.train) || !in_range(splits.val) {
        errors.push(format!(
            "splits.train and splits.val must be within [0, 1], got {} and {}",
            splits.train, splits.val
        ));
    } else if splits.train + splits.val > 1.0 + f64::EPSILON {
        errors.push(format!(
            "splits.train + splits.val must not exceed 1, got {}",
            splits.train + splits.val
        ));
    }
}

/// Validate a parsed compile configuration against the run's registries.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing every validation failure found.
pub fn validate_config(config: &CompileConfig, ctx: &CompileContext) -> Result<()> {
    let mut errors = Vec::new();

    if config.source.uri.trim().is_empty() {
        errors.push("source.uri must not be empty".to_string());
    }
    if let Some(selector) = &config.source.selector {
        if let Err(e) = Selector::parse(selector) {
            errors.push(format!("source.selector: {e}"));
        }
    }
    if config.output.dir.as_os_str().is_empty() {
        errors.push("output.dir must not be empty".to_string());
    }

    for (i, step) in config.transforms.iter().enumerate() {
        if let Err(e) = ctx.transforms.build(step) {
            errors.push(format!("transforms[{i}] ({}): {e}", step.name));
        }
    }

    validate_thresholds(&config.validation, &mut errors);
    validate_modes(&config.validation, &mut errors);
    if let Err(policy_errors) = SeverityPolicy::resolve(&ctx.rules, &config.validation) {
        errors.extend(policy_errors);
    }
    validate_sharding(&config.sharding, &mut errors);
    validate_execution(&config.execution, &mut errors);
    validate_splits(&config.splits, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Compile config validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use datakit_types::finding::Severity;

    use super::*;
    use crate::config::parser::parse_config_str;

    fn valid_config() -> CompileConfig {
        parse_config_str(
            r"
source:
  uri: /data/in
output:
  dir: /data/out
transforms:
  - name: task_text
  - name: pad_action
    params:
      target_dim: 7
",
        )
        .unwrap()
    }

    fn errors_of(config: &CompileConfig) -> String {
        validate_config(config, &CompileContext::with_builtins())
            .unwrap_err()
            .to_string()
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&valid_config(), &CompileContext::with_builtins()).is_ok());
    }

    #[test]
    fn test_unknown_transform() {
        let mut config = valid_config();
        config.transforms[0].name = "sharpen".into();
        assert!(errors_of(&config).contains("unknown transform 'sharpen'"));
    }

    #[test]
    fn test_zero_workers_and_shard_size() {
        let mut config = valid_config();
        config.execution.workers = 0;
        config.sharding.episodes_per_shard = 0;
        let err = errors_of(&config);
        assert!(err.contains("execution.workers"));
        assert!(err.contains("sharding.episodes_per_shard"));
    }

    #[test]
    fn test_bad_selector() {
        let mut config = valid_config();
        config.source.selector = Some("[4:1]".into());
        assert!(errors_of(&config).contains("source.selector"));
    }

    #[test]
    fn test_lowering_override_rejected() {
        let mut config = valid_config();
        config
            .validation
            .severity_overrides
            .insert("S001".into(), Severity::Info);
        assert!(errors_of(&config).contains("only escalate"));
    }

    #[test]
    fn test_strict_conflict_rejected() {
        let mut config = valid_config();
        config.validation.strict = true;
        config
            .validation
            .severity_overrides
            .insert("T302".into(), Severity::Warn);
        assert!(errors_of(&config).contains("strict"));
    }

    #[test]
    fn test_skip_validation_combinations() {
        let mut config = valid_config();
        config.validation.skip_validation = true;
        config.validation.fail_fast = true;
        config.validation.quarantine = true;
        let err = errors_of(&config);
        assert!(err.contains("fail_fast"));
        assert!(err.contains("quarantine"));
    }

    #[test]
    fn test_split_fractions() {
        let mut config = valid_config();
        config.splits.train = 0.9;
        config.splits.val = 0.2;
        assert!(errors_of(&config).contains("must not exceed 1"));
    }

    #[test]
    fn test_all_errors_reported_together() {
        let mut config = valid_config();
        config.validation.min_episode_length = 0;
        config.validation.action_bounds = [1.0, -1.0];
        config.execution.queue_depth_per_worker = 0;
        let err = errors_of(&config);
        assert_eq!(err.matches("\n  - ").count(), 3);
    }
}
