use std::path::{Path, PathBuf};

use anyhow::Context;
use datakit_engine::config::parser;
use datakit_engine::{validate_only, CancelToken, CompileContext};

use super::{cancel_on_ctrl_c, Failure, Outcome};

/// Execute the `validate` command: transforms and rules only, no shards.
pub async fn execute(config_path: &Path, report_dir: Option<PathBuf>) -> Outcome {
    let config = parser::parse_config(config_path)
        .with_context(|| format!("Failed to parse config: {}", config_path.display()))
        .map_err(Failure::fatal)?;

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);

    let result = validate_only(&config, &CompileContext::with_builtins(), report_dir, cancel).await?;
    let summary = &result.report.summary;

    println!("Validated {} episodes.", summary.total_episodes);
    println!("  Valid:        {}", summary.valid_episodes);
    println!("  Invalid:      {}", summary.invalid_episodes);
    println!("  Error:        {}", summary.error_episodes);
    println!(
        "  Findings:     {} error, {} warn, {} info",
        summary.error_count, summary.warn_count, summary.info_count
    );
    println!("  Invalid ratio: {:.3}", result.report.invalid_ratio());
    if let Some(dir) = &result.report_dir {
        println!("  Report:       {}", dir.display());
    }
    println!("  Duration:     {:.2}s", result.duration_secs);

    Ok(result.exit_status)
}
