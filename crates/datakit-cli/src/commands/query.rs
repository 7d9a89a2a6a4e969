use std::path::Path;

use anyhow::Context;
use datakit_engine::index::slice::{load_view, SLICE_MANIFEST_FILE};
use datakit_engine::storage::layout::INFO_FILE;
use datakit_engine::{EpisodeIndex, ExitStatus};
use datakit_types::state::Partition;

use super::{parse_predicate, require_dataset, Failure, Outcome};

/// Load the index of a compiled dataset, or of the view slice stored in `dir`.
fn load_index(dir: &Path, quarantine: bool) -> Result<EpisodeIndex, Failure> {
    let layout = require_dataset(dir)?;
    if dir.join(SLICE_MANIFEST_FILE).exists() && !layout.partition_file(Partition::Main, INFO_FILE).exists() {
        if quarantine {
            return Err(Failure::fatal(anyhow::anyhow!(
                "view slices have no quarantine partition"
            )));
        }
        return Ok(load_view(dir).map_err(Failure::fatal)?.index);
    }
    let partition = if quarantine { Partition::Quarantine } else { Partition::Main };
    EpisodeIndex::load(&layout, partition)
        .with_context(|| format!("Failed to load index of {}", dir.display()))
        .map_err(Failure::fatal)
}

/// Execute the `query` command: print matching episode ids in commit order.
pub fn execute(dataset: &Path, predicate: Option<&str>, quarantine: bool, count: bool, json: bool) -> Outcome {
    let predicate = parse_predicate(predicate)?;
    let index = load_index(dataset, quarantine)?;

    if count {
        println!("{}", index.count(&predicate));
        return Ok(ExitStatus::Success);
    }
    for record in index.query_records(&predicate) {
        if json {
            let line = serde_json::to_string(record)
                .context("Failed to serialize index record")
                .map_err(Failure::fatal)?;
            println!("{line}");
        } else {
            println!("{}", record.episode_id);
        }
    }
    Ok(ExitStatus::Success)
}
