use std::path::{Path, PathBuf};

use anyhow::Context;
use datakit_engine::config::parser;
use datakit_engine::{compile, CancelToken, CompileContext};

use super::{cancel_on_ctrl_c, Failure, Outcome};

/// Execute the `compile` command: parse the config, compile, print a summary.
pub async fn execute(
    config_path: &Path,
    resume: bool,
    workers: Option<usize>,
    output: Option<PathBuf>,
) -> Outcome {
    let mut config = parser::parse_config(config_path)
        .with_context(|| format!("Failed to parse config: {}", config_path.display()))
        .map_err(Failure::fatal)?;
    if resume {
        config.execution.resume = true;
    }
    if let Some(workers) = workers {
        config.execution.workers = workers;
    }
    if let Some(output) = output {
        config.output.dir = output;
    }

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);

    let result = compile(&config, &CompileContext::with_builtins(), cancel).await?;

    println!("Build {} finished.", result.build_id);
    println!("  Output:       {}", result.output_dir.display());
    if result.resumed {
        println!("  Resumed:      {} episodes already committed", result.stats.episodes_skipped);
    }
    println!("  Episodes:     {}", result.tally.total());
    println!("    Accepted:   {}", result.tally.accepted);
    println!("    Quarantined: {}", result.tally.quarantined);
    println!("    Rejected:   {}", result.tally.rejected);
    println!("  Shards:       {}", result.stats.shards_committed);
    match &result.report {
        Some(report) => println!(
            "  Findings:     {} error, {} warn, {} info",
            report.summary.error_count, report.summary.warn_count, report.summary.info_count
        ),
        None => println!("  Findings:     validation skipped"),
    }
    println!("  Duration:     {:.2}s", result.duration_secs);

    Ok(result.exit_status)
}
