use std::path::Path;

use datakit_engine::{export_dataset, ExitStatus, ExportOptions};

use super::{parse_predicate, require_dataset, Failure, Outcome};

/// Execute the `export` command: write RLDS-style TFRecord shards.
pub fn execute(
    dataset: &Path,
    output: &Path,
    predicate: Option<&str>,
    episodes_per_file: usize,
    skip_invalid: bool,
) -> Outcome {
    let options = ExportOptions {
        episodes_per_file,
        predicate: parse_predicate(predicate)?,
        skip_invalid,
    };
    require_dataset(dataset)?;

    let info = export_dataset(dataset, output, &options).map_err(Failure::fatal)?;

    println!("Exported '{}' to {}", info.name, output.display());
    for (split, entry) in &info.splits {
        println!(
            "  {split}: {} episodes in {} files",
            entry.num_examples, entry.num_shards
        );
    }
    if info.provenance.lossy {
        println!("  Lossy export:");
        for loss in &info.provenance.losses {
            println!("    - {loss}");
        }
    }
    Ok(ExitStatus::Success)
}
