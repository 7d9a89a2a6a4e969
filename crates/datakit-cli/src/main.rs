mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use datakit_engine::{ExitStatus, SliceMode};

#[derive(Parser)]
#[command(
    name = "datakit",
    version,
    about = "Compile, validate, query and export robot-trajectory datasets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source into a sharded, indexed dataset
    Compile {
        /// Path to compile config YAML file
        config: PathBuf,
        /// Continue an interrupted build with the same build id
        #[arg(long)]
        resume: bool,
        /// Override `execution.workers`
        #[arg(long)]
        workers: Option<usize>,
        /// Override `output.dir`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run transforms and validation without writing a dataset
    Validate {
        /// Path to compile config YAML file
        config: PathBuf,
        /// Directory for validation_summary.json and findings.csv
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
    /// List episodes of a compiled dataset or view slice matching a predicate
    Query {
        /// Dataset or view slice directory
        dataset: PathBuf,
        /// Predicate, e.g. "num_steps >= 50 AND task_text LIKE 'pick%'"
        #[arg(long = "where")]
        predicate: Option<String>,
        /// Query the quarantine partition
        #[arg(long)]
        quarantine: bool,
        /// Print only the number of matches
        #[arg(long)]
        count: bool,
        /// Print full index records as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Materialise a subset of a dataset as a copy or a view
    Slice {
        /// Source dataset directory
        dataset: PathBuf,
        /// Output directory for the slice
        output: PathBuf,
        #[arg(long = "where")]
        predicate: Option<String>,
        #[arg(long, default_value = "view")]
        mode: SliceMode,
        /// Slice id (default: derived from the parent build id and predicate)
        #[arg(long)]
        slice_id: Option<String>,
        /// Episodes per shard of a copy slice
        #[arg(long, default_value_t = 1000)]
        episodes_per_shard: usize,
        /// Step rows per shard of a copy slice
        #[arg(long, default_value_t = 100_000)]
        frames_per_shard: u64,
    },
    /// Export a dataset to RLDS-style TFRecord shards
    Export {
        /// Source dataset directory
        dataset: PathBuf,
        /// Output directory
        output: PathBuf,
        #[arg(long = "where")]
        predicate: Option<String>,
        #[arg(long, default_value_t = datakit_engine::export::DEFAULT_EPISODES_PER_FILE)]
        episodes_per_file: usize,
        /// Leave out episodes flagged invalid
        #[arg(long)]
        skip_invalid: bool,
    },
}

async fn dispatch(command: Commands) -> commands::Outcome {
    match command {
        Commands::Compile {
            config,
            resume,
            workers,
            output,
        } => commands::compile::execute(&config, resume, workers, output).await,
        Commands::Validate { config, report_dir } => commands::validate::execute(&config, report_dir).await,
        Commands::Query {
            dataset,
            predicate,
            quarantine,
            count,
            json,
        } => commands::query::execute(&dataset, predicate.as_deref(), quarantine, count, json),
        Commands::Slice {
            dataset,
            output,
            predicate,
            mode,
            slice_id,
            episodes_per_shard,
            frames_per_shard,
        } => commands::slice::execute(
            &dataset,
            &output,
            predicate.as_deref(),
            mode,
            slice_id,
            episodes_per_shard,
            frames_per_shard,
        ),
        Commands::Export {
            dataset,
            output,
            predicate,
            episodes_per_file,
            skip_invalid,
        } => commands::export::execute(&dataset, &output, predicate.as_deref(), episodes_per_file, skip_invalid),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    let status = match dispatch(cli.command).await {
        Ok(status) => status,
        Err(failure) => {
            eprintln!("error: {:#}", failure.error);
            failure.status
        }
    };
    if status != ExitStatus::Success {
        tracing::debug!(exit_code = status.code(), "Exiting with failure status");
    }
    std::process::exit(status.code());
}
