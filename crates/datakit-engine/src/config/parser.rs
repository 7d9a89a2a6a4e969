//! Compile-config YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};

use crate::config::types::CompileConfig;

static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env var regex")
});

/// Substitute `${VAR}` and `${VAR:-default}` with environment values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is unset and has
/// no default.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &Captures<'_>| {
        let name = &cap[1];
        match (std::env::var(name), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a compile YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_config_str(yaml_str: &str) -> Result<CompileConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: CompileConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse compile config YAML")?;
    Ok(config)
}

/// Parse a compile YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_config(path: &Path) -> Result<CompileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("DK_TEST_ROOT", "/mnt/raw");
        let result = substitute_env_vars("uri: ${DK_TEST_ROOT}/bridge").unwrap();
        assert_eq!(result, "uri: /mnt/raw/bridge");
        std::env::remove_var("DK_TEST_ROOT");
    }

    #[test]
    fn test_default_used_when_unset() {
        let result = substitute_env_vars("dir: ${DK_UNSET_OUT_98765:-/tmp/out}").unwrap();
        assert_eq!(result, "dir: /tmp/out");
    }

    #[test]
    fn test_set_var_beats_default() {
        std::env::set_var("DK_TEST_WORKERS", "8");
        let result = substitute_env_vars("workers: ${DK_TEST_WORKERS:-1}").unwrap();
        assert_eq!(result, "workers: 8");
        std::env::remove_var("DK_TEST_WORKERS");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "source:\n  uri: /data";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let result = substitute_env_vars("${DK_MISSING_X} and ${DK_MISSING_Y}");
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("DK_MISSING_X"));
        assert!(err_msg.contains("DK_MISSING_Y"));
    }

    #[test]
    fn test_parse_config_from_string() {
        std::env::set_var("DK_TEST_SRC", "/data/bridge");
        let yaml = r"
source:
  uri: ${DK_TEST_SRC}
  version: 1.0.0
  selector: '[0:10]'
output:
  dir: ${DK_TEST_OUT_UNSET_4321:-/tmp/compiled}
execution:
  workers: 4
";
        let config = parse_config_str(yaml).unwrap();
        assert_eq!(config.source.uri, "/data/bridge");
        assert_eq!(config.source.selector.as_deref(), Some("[0:10]"));
        assert_eq!(config.output.dir, std::path::PathBuf::from("/tmp/compiled"));
        assert_eq!(config.execution.workers, 4);
        std::env::remove_var("DK_TEST_SRC");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        assert!(parse_config_str("this is not: [valid: yaml: {{{}}}").is_err());
    }

    #[test]
    fn test_parse_config_file_not_found() {
        let err_msg = parse_config(Path::new("/nonexistent/compile.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err_msg.contains("Failed to read config file"));
    }
}
