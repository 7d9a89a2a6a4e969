//! Compile orchestrator: feeds episodes through transforms and validation on
//! a bounded worker pool and serialises every durable write through one
//! writer task.
//!
//! ```text
//! feeder ──work queue──▶ workers (N) ──result queue──▶ writer
//! ```
//!
//! Both queues hold at most `workers × queue_depth_per_worker` episodes, so
//! a slow writer blocks the workers and a slow pool blocks the feeder.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use datakit_state::backend::CheckpointStore;
use datakit_types::episode::Episode;
use datakit_types::finding::{Severity, ValidationFinding};
use datakit_types::provenance::BuildProvenance;
use datakit_types::spec::DatasetSpec;
use datakit_types::state::{Checkpoint, Disposition, Partition, RunStats, RunStatus};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::checkpoint::prepare_output;
use crate::config::types::{CompileConfig, SplitConfig};
use crate::config::validate_config;
use crate::context::CompileContext;
use crate::errors::{CompileError, ExitStatus};
use crate::provenance::{BuildInputs, CODE_VERSION};
use crate::result::{completed_exit_status, CompileResult, DispositionTally, ValidateResult};
use crate::source::{open_source, EpisodeSource, Selector, SourceError};
use crate::split::assign_split;
use crate::storage::{finalize_dataset, CheckpointSink, DatasetLayout, FinalizeInput, ShardLimits, ShardWriter};
use crate::transform::TransformPipeline;
use crate::validate::report::{ReportBuilder, ValidationReport};
use crate::validate::{transform_failure_finding, EpisodeValidation, ValidationEngine};

// ---------------------------------------------------------------------------
// Per-episode processing
// ---------------------------------------------------------------------------

/// Disposition of a validated episode.
///
/// An episode whose transforms failed was never produced and is always
/// rejected. Otherwise only an ERROR finding keeps it out of the main
/// partition.
#[must_use]
pub fn decide_disposition(transformed: bool, worst: Option<Severity>, quarantine: bool) -> Disposition {
    match (transformed, worst) {
        (false, _) => Disposition::Rejected,
        (true, Some(Severity::Error)) if quarantine => Disposition::Quarantined,
        (true, Some(Severity::Error)) => Disposition::Rejected,
        (true, _) => Disposition::Accepted,
    }
}

struct Disposed {
    episode_id: String,
    disposition: Disposition,
    split: &'static str,
    findings: Vec<ValidationFinding>,
    /// `None` for rejected episodes.
    episode: Option<Episode>,
}

enum Outcome {
    Disposed(Disposed),
    /// Fail-fast trigger. The episode is not disposed.
    Abort {
        episode_id: String,
        code: String,
        findings: Vec<ValidationFinding>,
    },
}

/// Everything a worker needs, shared read-only by the pool.
struct EpisodePlan {
    spec: DatasetSpec,
    pipeline: TransformPipeline,
    /// `None` with `skip_validation`.
    engine: Option<ValidationEngine>,
    fail_fast: bool,
    quarantine: bool,
    seed: u64,
    splits: SplitConfig,
}

impl EpisodePlan {
    fn new(config: &CompileConfig, ctx: &CompileContext, spec: DatasetSpec) -> Result<Self, CompileError> {
        let pipeline = TransformPipeline::build(&ctx.transforms, &config.transforms)
            .map_err(|e| CompileError::Config(e.into()))?;
        let engine = if config.validation.skip_validation {
            tracing::warn!("Validation is disabled; every transformed episode will be accepted");
            None
        } else {
            Some(ValidationEngine::new(&ctx.rules, &config.validation).map_err(CompileError::Config)?)
        };
        Ok(Self {
            spec,
            pipeline,
            engine,
            fail_fast: config.validation.fail_fast,
            quarantine: config.validation.quarantine,
            seed: config.execution.seed,
            splits: config.splits.clone(),
        })
    }

    /// Transform, validate and dispose one episode. `None` when the run was
    /// cancelled mid-transform.
    fn process(&self, episode: Episode, cancel: &CancelToken) -> Option<Outcome> {
        let episode_id = episode.episode_id.clone();
        let split = assign_split(self.seed, &episode_id, &self.splits);
        let (episode, validation) = match self.pipeline.apply(episode, &self.spec, cancel) {
            Ok(episode) => {
                let validation = self
                    .engine
                    .as_ref()
                    .map(|engine| engine.run(&episode, &self.spec))
                    .unwrap_or_default();
                (Some(episode), validation)
            }
            Err(failure) if failure.is_cancelled() => return None,
            Err(failure) => {
                tracing::warn!(
                    episode_id = episode_id.as_str(),
                    transform = failure.transform.as_str(),
                    error = %failure.source,
                    "Transform failed"
                );
                let finding = transform_failure_finding(&episode_id, &failure.transform, &failure.source.to_string());
                (None, EpisodeValidation::from_transform_failure(finding))
            }
        };

        if self.fail_fast && validation.has_errors() {
            let code = validation
                .findings
                .iter()
                .find(|f| f.severity == Severity::Error)
                .map(|f| f.code.clone())
                .unwrap_or_default();
            cancel.cancel();
            return Some(Outcome::Abort {
                episode_id,
                code,
                findings: validation.findings,
            });
        }

        let disposition = decide_disposition(episode.is_some(), validation.worst, self.quarantine);
        let invalid = validation.worst >= Some(Severity::Warn);
        let episode = match disposition {
            Disposition::Rejected => None,
            Disposition::Accepted | Disposition::Quarantined => episode.map(|mut episode| {
                episode.invalid = invalid;
                episode
            }),
        };
        tracing::debug!(
            episode_id = episode_id.as_str(),
            disposition = %disposition,
            findings = validation.findings.len(),
            "Episode validated"
        );
        Some(Outcome::Disposed(Disposed {
            episode_id,
            disposition,
            split,
            findings: validation.findings,
            episode,
        }))
    }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FeedStats {
    seen: u64,
    skipped: u64,
}

/// Pull episodes lazily from the source, skipping already-disposed ids.
fn feed(
    source: &dyn EpisodeSource,
    selector: &Selector,
    disposed: &HashSet<String>,
    tx: &mpsc::Sender<Episode>,
    cancel: &CancelToken,
    stats: &mut FeedStats,
) -> Result<(), SourceError> {
    for episode in source.episodes(selector)? {
        if cancel.is_cancelled() {
            break;
        }
        let episode = episode?;
        stats.seen += 1;
        if disposed.contains(&episode.episode_id) {
            stats.skipped += 1;
            tracing::debug!(episode_id = episode.episode_id.as_str(), "Already disposed, skipping");
            continue;
        }
        if tx.blocking_send(episode).is_err() {
            break;
        }
    }
    Ok(())
}

fn work(
    plan: &EpisodePlan,
    rx: &Mutex<mpsc::Receiver<Episode>>,
    tx: &mpsc::Sender<Outcome>,
    cancel: &CancelToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let next = match rx.lock() {
            Ok(mut guard) => guard.blocking_recv(),
            Err(_) => return,
        };
        let Some(episode) = next else {
            return;
        };
        let Some(outcome) = plan.process(episode, cancel) else {
            return;
        };
        if tx.blocking_send(outcome).is_err() {
            return;
        }
    }
}

struct WriterRun {
    writer: ShardWriter,
    report: ReportBuilder,
    tally: DispositionTally,
    /// Episodes disposed by this run.
    run_tally: DispositionTally,
    abort: Option<(String, String)>,
}

/// The single consumer of the result queue and owner of the shard writer.
fn drive_writer(
    mut run: WriterRun,
    rx: &mut mpsc::Receiver<Outcome>,
    cancel: &CancelToken,
) -> anyhow::Result<WriterRun> {
    while let Some(outcome) = rx.blocking_recv() {
        match outcome {
            Outcome::Abort {
                episode_id,
                code,
                findings,
            } => {
                if run.abort.is_none() {
                    tracing::error!(
                        episode_id = episode_id.as_str(),
                        code = code.as_str(),
                        "Fail-fast: aborting run"
                    );
                    run.report.record(Disposition::Rejected, &findings);
                    run.abort = Some((episode_id, code));
                }
            }
            // Drain without writing once the run is stopping.
            Outcome::Disposed(_) if run.abort.is_some() || cancel.is_cancelled() => {}
            Outcome::Disposed(disposed) => {
                run.report.record(disposed.disposition, &disposed.findings);
                match (disposed.disposition, disposed.episode) {
                    (Disposition::Accepted, Some(episode)) => {
                        run.writer
                            .write(episode, Partition::Main, disposed.split, disposed.findings)?;
                    }
                    (Disposition::Quarantined, Some(episode)) => {
                        tracing::warn!(episode_id = disposed.episode_id.as_str(), "Episode quarantined");
                        run.writer
                            .write(episode, Partition::Quarantine, disposed.split, disposed.findings)?;
                    }
                    _ => {
                        tracing::warn!(episode_id = disposed.episode_id.as_str(), "Episode rejected");
                        run.writer.record_rejected(disposed.episode_id, disposed.findings);
                    }
                }
                run.tally.add(disposed.disposition);
                run.run_tally.add(disposed.disposition);
            }
        }
    }
    Ok(run)
}

// ---------------------------------------------------------------------------
// Compile
// ---------------------------------------------------------------------------

fn join_error(e: tokio::task::JoinError) -> CompileError {
    CompileError::Infrastructure(anyhow::anyhow!("compile task failed: {e}"))
}

struct Prepared {
    spec: DatasetSpec,
    provenance: BuildProvenance,
    layout: DatasetLayout,
    store: Arc<dyn CheckpointStore>,
    checkpoint: Option<Checkpoint>,
    run_id: i64,
}

fn prepare(config: &CompileConfig, source: &dyn EpisodeSource) -> Result<Prepared, CompileError> {
    let mut spec = source.probe()?;
    if let Some(name) = &config.output.dataset_name {
        spec.dataset_name.clone_from(name);
    }
    let source_uri = source.identity();
    let source_version = if config.source.version.is_empty() {
        source.version().unwrap_or_default()
    } else {
        config.source.version.clone()
    };
    let provenance = BuildInputs {
        source_uri: &source_uri,
        source_version: &source_version,
        transforms: &config.transforms,
        code_version: CODE_VERSION,
        seed: config.execution.seed,
    }
    .provenance();
    spec.source_uri = source_uri;
    spec.build_id = provenance.build_id.to_string();
    spec.transform_pipeline = config.transforms.iter().map(|t| t.name.clone()).collect();

    let layout = DatasetLayout::new(&config.output.dir);
    let prepared = prepare_output(&layout, &provenance.build_id, config.execution.resume)?;
    let run_id = prepared
        .store
        .start_run(&provenance.build_id, prepared.checkpoint.is_some())?;
    Ok(Prepared {
        spec,
        provenance,
        layout,
        store: prepared.store,
        checkpoint: prepared.checkpoint,
        run_id,
    })
}

fn close_run(store: &dyn CheckpointStore, run_id: i64, status: RunStatus, stats: &RunStats) {
    if let Err(e) = store.complete_run(run_id, status, stats) {
        tracing::error!(run_id, error = %e, "Failed to record run completion");
    }
}

fn selector_of(config: &CompileConfig) -> Result<Selector, CompileError> {
    config
        .source
        .selector
        .as_deref()
        .map_or(Ok(Selector::all()), Selector::parse)
        .map_err(|e| CompileError::Config(e.into()))
}

/// Compile the source named in `config.source.uri`.
pub async fn compile(
    config: &CompileConfig,
    ctx: &CompileContext,
    cancel: CancelToken,
) -> Result<CompileResult, CompileError> {
    validate_config(config, ctx).map_err(CompileError::Config)?;
    let uri = config.source.uri.clone();
    let split = config.source.split.clone();
    let source = tokio::task::spawn_blocking(move || open_source(&uri, &split))
        .await
        .map_err(join_error)??;
    compile_source(config, Arc::from(source), ctx, cancel).await
}

/// Compile episodes from `source` into `config.output.dir`.
#[allow(clippy::too_many_lines)]
pub async fn compile_source(
    config: &CompileConfig,
    source: Arc<dyn EpisodeSource>,
    ctx: &CompileContext,
    cancel: CancelToken,
) -> Result<CompileResult, CompileError> {
    let started = Instant::now();
    validate_config(config, ctx).map_err(CompileError::Config)?;
    let selector = selector_of(config)?;

    let prepared = {
        let config = config.clone();
        let source = Arc::clone(&source);
        tokio::task::spawn_blocking(move || prepare(&config, source.as_ref()))
            .await
            .map_err(join_error)??
    };
    let Prepared {
        spec,
        provenance,
        layout,
        store,
        checkpoint,
        run_id,
    } = prepared;
    let build_id = provenance.build_id.clone();
    let resumed = checkpoint.is_some();
    tracing::info!(
        build_id = build_id.as_str(),
        source = spec.source_uri.as_str(),
        output = %layout.root().display(),
        workers = config.execution.workers,
        resumed,
        "Compile started"
    );

    let mut stats = RunStats::default();
    let plan = match EpisodePlan::new(config, ctx, spec.clone()) {
        Ok(plan) => Arc::new(plan),
        Err(e) => {
            stats.error_message = Some(e.to_string());
            close_run(store.as_ref(), run_id, RunStatus::Failed, &stats);
            return Err(e);
        }
    };

    let limits = ShardLimits {
        episodes_per_shard: config.sharding.episodes_per_shard,
        frames_per_shard: config.sharding.frames_per_shard,
    };
    let sink = CheckpointSink {
        store: Arc::clone(&store),
        build: build_id.clone(),
    };
    let mut report = ReportBuilder::new(config.validation.max_findings_per_code);
    let mut tally = DispositionTally::default();
    let (writer, disposed, committed_before) = match &checkpoint {
        Some(checkpoint) => {
            for episode in &checkpoint.disposed {
                report.record(episode.disposition, &episode.findings);
                tally.add(episode.disposition);
            }
            let writer = match ShardWriter::resume(layout.clone(), spec.clone(), limits, checkpoint) {
                Ok(writer) => writer,
                Err(e) => {
                    stats.error_message = Some(format!("{e:#}"));
                    close_run(store.as_ref(), run_id, RunStatus::Failed, &stats);
                    return Err(CompileError::Infrastructure(e));
                }
            };
            (writer, checkpoint.disposed_ids(), checkpoint.shards.len())
        }
        None => (ShardWriter::new(layout.clone(), spec.clone(), limits), HashSet::new(), 0),
    };
    let writer = writer.with_checkpoint(sink);

    let capacity = config.execution.queue_capacity();
    let (work_tx, work_rx) = mpsc::channel::<Episode>(capacity);
    let (result_tx, mut result_rx) = mpsc::channel::<Outcome>(capacity);

    let writer_task = {
        let cancel = cancel.clone();
        let run = WriterRun {
            writer,
            report,
            tally,
            run_tally: DispositionTally::default(),
            abort: None,
        };
        tokio::task::spawn_blocking(move || {
            let result = drive_writer(run, &mut result_rx, &cancel);
            if result.is_err() {
                cancel.cancel();
            }
            result
        })
    };

    let work_rx = Arc::new(Mutex::new(work_rx));
    let mut workers = JoinSet::new();
    for _ in 0..config.execution.workers {
        let plan = Arc::clone(&plan);
        let rx = Arc::clone(&work_rx);
        let tx = result_tx.clone();
        let cancel = cancel.clone();
        workers.spawn_blocking(move || work(&plan, &rx, &tx, &cancel));
    }
    drop(work_rx);
    drop(result_tx);

    let feeder = {
        let source = Arc::clone(&source);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut feed_stats = FeedStats::default();
            let result = feed(source.as_ref(), &selector, &disposed, &work_tx, &cancel, &mut feed_stats);
            (feed_stats, result)
        })
    };

    let (feed_stats, feed_result) = feeder.await.map_err(join_error)?;
    let mut worker_panic = None;
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            cancel.cancel();
            worker_panic.get_or_insert(e);
        }
    }
    let writer_result = writer_task.await.map_err(join_error)?;

    stats.episodes_seen = feed_stats.seen;
    stats.episodes_skipped = feed_stats.skipped;

    let mut run = match writer_result {
        Ok(run) => run,
        Err(e) => {
            tracing::error!(error = %e, "Shard writer failed");
            stats.error_message = Some(format!("{e:#}"));
            close_run(store.as_ref(), run_id, RunStatus::Failed, &stats);
            return Err(CompileError::Infrastructure(e));
        }
    };
    stats.accepted = run.run_tally.accepted;
    stats.quarantined = run.run_tally.quarantined;
    stats.rejected = run.run_tally.rejected;

    if let Some(e) = worker_panic {
        let _ = run.writer.abort();
        let err = join_error(e);
        stats.error_message = Some(err.to_string());
        close_run(store.as_ref(), run_id, RunStatus::Failed, &stats);
        return Err(err);
    }
    if let Err(e) = feed_result {
        tracing::error!(error = %e, "Source failed mid-run");
        let _ = run.writer.abort();
        stats.error_message = Some(e.to_string());
        close_run(store.as_ref(), run_id, RunStatus::Failed, &stats);
        return Err(e.into());
    }

    if let Some((episode_id, code)) = run.abort.take() {
        stats.shards_committed = (run.writer.committed_shards().len() - committed_before) as u64;
        run.writer.abort()?;
        if plan.engine.is_some() {
            run.report.finish().write_to(&layout.reports_dir())?;
        }
        let err = CompileError::Aborted { episode_id, code };
        stats.error_message = Some(err.to_string());
        close_run(store.as_ref(), run_id, RunStatus::Aborted, &stats);
        return Err(err);
    }
    if cancel.is_cancelled() {
        tracing::warn!(build_id = build_id.as_str(), "Compile interrupted");
        stats.shards_committed = (run.writer.committed_shards().len() - committed_before) as u64;
        run.writer.abort()?;
        close_run(store.as_ref(), run_id, RunStatus::Interrupted, &stats);
        return Err(CompileError::Interrupted);
    }

    let WriterRun {
        writer, report, tally, ..
    } = run;
    let finished = {
        let layout = layout.clone();
        let skip_report = plan.engine.is_none();
        tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let written = writer.finish()?;
            let report = report.finish();
            if !skip_report {
                report.write_to(&layout.reports_dir())?;
            }
            let mut finalized_spec = spec;
            finalized_spec.task_catalog = written.snapshot.catalog.clone();
            let summary = finalize_dataset(&FinalizeInput {
                layout: &layout,
                spec: &finalized_spec,
                written: &written,
                provenance: &provenance,
            })
            .context("Failed to finalize dataset")?;
            Ok((written.shards.len(), report, summary))
        })
        .await
        .map_err(join_error)?
    };
    let (total_shards, report, finalize) = match finished {
        Ok(done) => done,
        Err(e) => {
            tracing::error!(error = %e, "Finalization failed");
            stats.error_message = Some(format!("{e:#}"));
            close_run(store.as_ref(), run_id, RunStatus::Failed, &stats);
            return Err(CompileError::Infrastructure(e));
        }
    };
    stats.shards_committed = (total_shards - committed_before) as u64;
    close_run(store.as_ref(), run_id, RunStatus::Completed, &stats);

    let report = plan.engine.is_some().then_some(report);
    let exit_status = completed_exit_status(&tally, report.as_ref(), config.validation.max_invalid_ratio);
    let duration_secs = started.elapsed().as_secs_f64();
    tracing::info!(
        build_id = build_id.as_str(),
        accepted = tally.accepted,
        quarantined = tally.quarantined,
        rejected = tally.rejected,
        shards = total_shards,
        duration_secs,
        exit_code = exit_status.code(),
        "Compile finished"
    );
    Ok(CompileResult {
        build_id,
        output_dir: layout.root().to_path_buf(),
        resumed,
        stats,
        tally,
        report,
        finalize,
        duration_secs,
        exit_status,
    })
}

// ---------------------------------------------------------------------------
// Validate only
// ---------------------------------------------------------------------------

/// Exit status of a validate-only run: any ERROR episode is a validation
/// error, a breached invalid ratio a partial failure.
#[must_use]
pub fn validate_exit_status(report: &ValidationReport, max_invalid_ratio: Option<f64>) -> ExitStatus {
    if report.summary.error_episodes > 0 {
        ExitStatus::ValidationError
    } else if max_invalid_ratio.is_some_and(|max| report.invalid_ratio() > max) {
        ExitStatus::PartialFailure
    } else {
        ExitStatus::Success
    }
}

/// Run transforms and validation over the configured source without
/// writing shards.
pub async fn validate_only(
    config: &CompileConfig,
    ctx: &CompileContext,
    report_dir: Option<PathBuf>,
    cancel: CancelToken,
) -> Result<ValidateResult, CompileError> {
    validate_config(config, ctx).map_err(CompileError::Config)?;
    let uri = config.source.uri.clone();
    let split = config.source.split.clone();
    let source = tokio::task::spawn_blocking(move || open_source(&uri, &split))
        .await
        .map_err(join_error)??;
    validate_source(config, Arc::from(source), ctx, report_dir, cancel).await
}

/// Validate episodes from `source`; findings go to `report_dir` if given.
pub async fn validate_source(
    config: &CompileConfig,
    source: Arc<dyn EpisodeSource>,
    ctx: &CompileContext,
    report_dir: Option<PathBuf>,
    cancel: CancelToken,
) -> Result<ValidateResult, CompileError> {
    let started = Instant::now();
    let selector = selector_of(config)?;
    let mut config = config.clone();
    // Every episode is reported; nothing is written, so no run can abort.
    config.validation.fail_fast = false;
    config.validation.skip_validation = false;

    let spec = {
        let source = Arc::clone(&source);
        tokio::task::spawn_blocking(move || source.probe())
            .await
            .map_err(join_error)??
    };
    let plan = EpisodePlan::new(&config, ctx, spec)?;
    let max_per_code = config.validation.max_findings_per_code;
    let report = tokio::task::spawn_blocking(move || -> Result<ValidationReport, CompileError> {
        let mut builder = ReportBuilder::new(max_per_code);
        for episode in source.episodes(&selector)? {
            if cancel.is_cancelled() {
                return Err(CompileError::Interrupted);
            }
            match plan.process(episode?, &cancel) {
                Some(Outcome::Disposed(d)) => builder.record(d.disposition, &d.findings),
                Some(Outcome::Abort { findings, .. }) => builder.record(Disposition::Rejected, &findings),
                None => return Err(CompileError::Interrupted),
            }
        }
        Ok(builder.finish())
    })
    .await
    .map_err(join_error)??;

    if let Some(dir) = &report_dir {
        report.write_to(dir)?;
    }
    let exit_status = validate_exit_status(&report, config.validation.max_invalid_ratio);
    tracing::info!(
        episodes = report.summary.total_episodes,
        errors = report.summary.error_episodes,
        invalid = report.summary.invalid_episodes,
        exit_code = exit_status.code(),
        "Validation finished"
    );
    Ok(ValidateResult {
        report,
        report_dir,
        duration_secs: started.elapsed().as_secs_f64(),
        exit_status,
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use datakit_types::episode::Step;
    use datakit_types::tensor::Tensor;

    use super::*;
    use crate::config::parse_config_str;
    use crate::source::MemorySource;

    fn episode(id: &str, steps: usize) -> Episode {
        let mut ep = Episode::new(id, "ds");
        ep.task_text = "pick".into();
        ep.episode_metadata.insert("robot_id".into(), serde_json::json!("r1"));
        for i in 0..steps {
            let mut step = Step::new(false, false, i as f64 * 0.1);
            step.action = Some(Tensor::vector_f32(vec![0.0, 0.5]));
            step.observation.insert("observation.state".into(), Tensor::vector_f32(vec![1.0]));
            ep.steps.push(step);
        }
        ep.mark_boundaries();
        ep
    }

    fn broken(id: &str) -> Episode {
        let mut ep = episode(id, 3);
        ep.steps[0].is_first = false;
        ep
    }

    fn config(out: &Path, extra: &str) -> CompileConfig {
        parse_config_str(&format!(
            "source:\n  uri: memory\noutput:\n  dir: {}\nexecution:\n  workers: 2\n{extra}",
            out.display()
        ))
        .unwrap()
    }

    fn source(episodes: Vec<Episode>) -> Arc<dyn EpisodeSource> {
        Arc::new(MemorySource::new(DatasetSpec::new("ds", "Demo"), episodes))
    }

    #[test]
    fn test_decide_disposition() {
        assert_eq!(decide_disposition(true, None, false), Disposition::Accepted);
        assert_eq!(decide_disposition(true, Some(Severity::Warn), false), Disposition::Accepted);
        assert_eq!(decide_disposition(true, Some(Severity::Error), false), Disposition::Rejected);
        assert_eq!(decide_disposition(true, Some(Severity::Error), true), Disposition::Quarantined);
        assert_eq!(decide_disposition(false, Some(Severity::Error), true), Disposition::Rejected);
    }

    #[tokio::test]
    async fn test_compile_routes_episodes() {
        let out = tempfile::tempdir().unwrap();
        let config = config(out.path(), "");
        let result = compile_source(
            &config,
            source(vec![episode("a", 4), broken("b"), episode("c", 2)]),
            &CompileContext::with_builtins(),
            CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.tally.accepted, 2);
        assert_eq!(result.tally.rejected, 1);
        assert_eq!(result.exit_status, ExitStatus::PartialFailure);
        assert_eq!(result.finalize.main_episodes, 2);
        assert!(out.path().join("reports/validation_summary.json").exists());
    }

    #[tokio::test]
    async fn test_fail_fast_aborts() {
        let out = tempfile::tempdir().unwrap();
        let config = config(out.path(), "validation:\n  fail_fast: true\n");
        let err = compile_source(
            &config,
            source(vec![broken("bad")]),
            &CompileContext::with_builtins(),
            CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CompileError::Aborted { ref episode_id, .. } if episode_id == "bad"));
        assert_eq!(err.exit_status(), ExitStatus::ValidationError);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_interrupted() {
        let out = tempfile::tempdir().unwrap();
        let config = config(out.path(), "");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = compile_source(
            &config,
            source(vec![episode("a", 2)]),
            &CompileContext::with_builtins(),
            cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_status(), ExitStatus::Interrupted);
        assert!(!out.path().join("meta/info.json").exists());
    }

    #[tokio::test]
    async fn test_validate_only_writes_no_shards() {
        let out = tempfile::tempdir().unwrap();
        let reports = out.path().join("reports");
        let config = config(out.path(), "");
        let result = validate_source(
            &config,
            source(vec![episode("a", 2), broken("b")]),
            &CompileContext::with_builtins(),
            Some(reports.clone()),
            CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.report.summary.total_episodes, 2);
        assert_eq!(result.report.summary.error_episodes, 1);
        assert_eq!(result.exit_status, ExitStatus::ValidationError);
        assert!(reports.join("findings.csv").exists());
        assert!(!out.path().join("data").exists());
    }
}
