use std::path::Path;

use datakit_engine::storage::ShardLimits;
use datakit_engine::{slice_dataset, ExitStatus, SliceMode, SliceRequest};

use super::{parse_predicate, require_dataset, Failure, Outcome};

/// Execute the `slice` command.
pub fn execute(
    dataset: &Path,
    output: &Path,
    predicate: Option<&str>,
    mode: SliceMode,
    slice_id: Option<String>,
    episodes_per_shard: usize,
    frames_per_shard: u64,
) -> Outcome {
    let predicate = parse_predicate(predicate)?;
    require_dataset(dataset)?;

    let manifest = slice_dataset(&SliceRequest {
        source: dataset,
        output,
        predicate: &predicate,
        mode,
        slice_id,
        limits: ShardLimits {
            episodes_per_shard,
            frames_per_shard,
        },
    })
    .map_err(Failure::fatal)?;

    println!(
        "Slice '{}' ({}) written to {}: {} episodes",
        manifest.slice_id,
        manifest.mode,
        output.display(),
        manifest.episode_ids.len()
    );
    Ok(ExitStatus::Success)
}
