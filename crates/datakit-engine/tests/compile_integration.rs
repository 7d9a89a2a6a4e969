//! End-to-end tests: compile a synthetic source, then read, query, resume
//! and export the result.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use datakit_engine::cancel::CancelToken;
use datakit_engine::config::{parse_config_str, CompileConfig};
use datakit_engine::context::CompileContext;
use datakit_engine::errors::{CompileError, ExitStatus};
use datakit_engine::export::{export_dataset, read_examples, ExportOptions, IS_FIRST_FEATURE, IS_LAST_FEATURE};
use datakit_engine::index::{EpisodeIndex, Predicate, PredicateError};
use datakit_engine::orchestrator::compile_source;
use datakit_engine::source::{EpisodeIter, EpisodeSource, MemorySource, Selector, SourceError};
use datakit_engine::storage::finalize::{read_stats, verify_checksums};
use datakit_engine::storage::{DatasetLayout, DatasetReader};
use datakit_types::episode::{Episode, Step};
use datakit_types::finding::Severity;
use datakit_types::spec::DatasetSpec;
use datakit_types::state::Partition;
use datakit_types::tensor::Tensor;

fn episode(id: &str, steps: usize) -> Episode {
    let mut ep = Episode::new(id, "ds");
    ep.task_text = format!("task for {id}");
    ep.episode_metadata.insert("robot_id".into(), serde_json::json!("arm-1"));
    for i in 0..steps {
        let t = u32::try_from(i).unwrap();
        let mut step = Step::new(false, false, f64::from(t) * 0.125);
        step.action = Some(Tensor::vector_f32(vec![0.05 * t as f32, -0.5]));
        step.reward = Some(0.0);
        step.discount = Some(1.0);
        step.observation
            .insert("observation.state".into(), Tensor::vector_f32(vec![t as f32, 1.0, 2.0]));
        let shade = u8::try_from(i % 251).unwrap();
        step.observation.insert(
            "observation.images.front".into(),
            Tensor::image(2, 2, 3, (0..12).map(|p| shade.wrapping_add(p)).collect()).unwrap(),
        );
        ep.steps.push(step);
    }
    ep.mark_boundaries();
    ep
}

/// First step is not flagged `is_first`: a structural ERROR.
fn broken(id: &str) -> Episode {
    let mut ep = episode(id, 4);
    ep.steps[0].is_first = false;
    ep
}

fn config(out: &Path, extra: &str) -> CompileConfig {
    parse_config_str(&format!(
        "source:\n  uri: memory\noutput:\n  dir: {}\nsharding:\n  episodes_per_shard: 2\n{extra}",
        out.display()
    ))
    .unwrap()
}

fn memory(episodes: Vec<Episode>) -> Arc<dyn EpisodeSource> {
    Arc::new(MemorySource::new(DatasetSpec::new("ds", "Synthetic"), episodes))
}

async fn compile(config: &CompileConfig, source: Arc<dyn EpisodeSource>) -> Result<datakit_engine::CompileResult, CompileError> {
    compile_source(config, source, &CompileContext::with_builtins(), CancelToken::new()).await
}

#[tokio::test]
async fn test_boundaries_survive_compile() {
    let out = tempfile::tempdir().unwrap();
    let result = compile(
        &config(out.path(), ""),
        memory(vec![episode("a", 5), episode("b", 1), broken("c")]),
    )
    .await
    .unwrap();
    assert_eq!(result.exit_status, ExitStatus::PartialFailure);

    let mut reader = DatasetReader::open(DatasetLayout::new(out.path()), Partition::Main).unwrap();
    let records = reader.records().to_vec();
    assert_eq!(
        records.iter().map(|r| r.episode_id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    for record in &records {
        let ep = reader.read_episode(record).unwrap();
        let firsts: Vec<usize> = (0..ep.steps.len()).filter(|&i| ep.steps[i].is_first).collect();
        let lasts: Vec<usize> = (0..ep.steps.len()).filter(|&i| ep.steps[i].is_last).collect();
        assert_eq!(firsts, vec![0]);
        assert_eq!(lasts, vec![ep.steps.len() - 1]);
        assert_eq!(ep, {
            let mut expected = episode(&record.episode_id, ep.steps.len());
            expected.task_id = Some(record.task_id);
            expected.source_episode_index = record.source_episode_index;
            expected.invalid = ep.invalid;
            expected
        });
    }

    let report = result.report.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| f.episode_id == "c" && f.code == "S002" && f.severity == Severity::Error));
    assert!(verify_checksums(&DatasetLayout::new(out.path())).unwrap().is_empty());
}

#[tokio::test]
async fn test_quarantine_keeps_errors_out_of_main() {
    let out = tempfile::tempdir().unwrap();
    let result = compile(
        &config(out.path(), "validation:\n  quarantine: true\n"),
        memory(vec![episode("a", 3), broken("bad"), episode("b", 3)]),
    )
    .await
    .unwrap();
    assert_eq!(result.tally.quarantined, 1);

    let layout = DatasetLayout::new(out.path());
    let main = EpisodeIndex::load(&layout, Partition::Main).unwrap();
    assert!(main.get("bad").is_none());
    assert_eq!(main.len(), 2);

    let quarantine = EpisodeIndex::load(&layout, Partition::Quarantine).unwrap();
    let record = quarantine.get("bad").unwrap();
    assert!(record.invalid);
    assert!(result
        .report
        .unwrap()
        .findings
        .iter()
        .any(|f| f.episode_id == "bad" && f.severity == Severity::Error));
    assert!(out.path().join("quarantine/meta/info.json").exists());
}

#[tokio::test]
async fn test_query_compiled_index() {
    let out = tempfile::tempdir().unwrap();
    compile(
        &config(out.path(), ""),
        memory(vec![episode("short", 10), episode("mid", 60), episode("long", 100)]),
    )
    .await
    .unwrap();
    let index = EpisodeIndex::load(&DatasetLayout::new(out.path()), Partition::Main).unwrap();

    let predicate = Predicate::parse("num_steps >= 50").unwrap();
    assert_eq!(index.query(&predicate), vec!["mid", "long"]);
    assert_eq!(
        index.query(&Predicate::parse("task_text LIKE '%long' AND robot_id = 'arm-1'").unwrap()),
        vec!["long"]
    );
    assert!(matches!(
        Predicate::parse("colour = 'red'"),
        Err(PredicateError::UnknownField(field)) if field == "colour"
    ));
}

#[tokio::test]
async fn test_build_id_is_deterministic() {
    let source = || memory(vec![episode("a", 3)]);
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let third = tempfile::tempdir().unwrap();

    let a = compile(&config(first.path(), ""), source()).await.unwrap();
    let b = compile(&config(second.path(), ""), source()).await.unwrap();
    let c = compile(&config(third.path(), "execution:\n  seed: 7\n"), source())
        .await
        .unwrap();
    assert_eq!(a.build_id, b.build_id);
    assert_ne!(a.build_id, c.build_id);
}

#[tokio::test]
async fn test_export_round_trip() {
    let out = tempfile::tempdir().unwrap();
    let exported = tempfile::tempdir().unwrap();
    compile(&config(out.path(), ""), memory(vec![episode("only", 5)]))
        .await
        .unwrap();

    let info = export_dataset(out.path(), exported.path(), &ExportOptions::default()).unwrap();
    let split = info.splits.values().next().unwrap();
    assert_eq!(split.num_examples, 1);
    let examples = read_examples(&exported.path().join(&split.files[0])).unwrap();
    assert_eq!(examples.len(), 1);

    let example = &examples[0];
    assert_eq!(example.int64s(IS_FIRST_FEATURE), Some(&[1, 0, 0, 0, 0][..]));
    assert_eq!(example.int64s(IS_LAST_FEATURE), Some(&[0, 0, 0, 0, 1][..]));
    assert_eq!(example.bytes("steps/observation/images/front").unwrap().len(), 5);
    assert_eq!(example.int64s("steps/observation/state/len"), Some(&[3, 3, 3, 3, 3][..]));
    assert!(info.features.contains_key("steps/observation/images/front"));
    assert!(info.features.contains_key("steps/observation/state"));
    assert!(!info.provenance.lossy, "unexpected losses: {:?}", info.provenance.losses);
}

/// Cancels the run once the first shard is on disk, before yielding the
/// episode at `after`.
struct InterruptingSource {
    inner: MemorySource,
    cancel: CancelToken,
    first_shard: std::path::PathBuf,
    after: usize,
}

impl EpisodeSource for InterruptingSource {
    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn probe(&self) -> Result<DatasetSpec, SourceError> {
        self.inner.probe()
    }

    fn episodes(&self, selector: &Selector) -> Result<EpisodeIter<'_>, SourceError> {
        let iter = self.inner.episodes(selector)?.enumerate().map(move |(i, episode)| {
            if i == self.after {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !self.first_shard.exists() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                self.cancel.cancel();
            }
            episode
        });
        Ok(Box::new(iter))
    }
}

#[tokio::test]
async fn test_resume_matches_uninterrupted_run() {
    let episodes: Vec<Episode> = (0..7)
        .map(|i| if i == 3 { broken(&format!("ep-{i}")) } else { episode(&format!("ep-{i}"), 3 + i) })
        .collect();
    let source = MemorySource::new(DatasetSpec::new("ds", "Synthetic"), episodes.clone());

    let reference = tempfile::tempdir().unwrap();
    let expected = compile(&config(reference.path(), ""), memory(episodes.clone()))
        .await
        .unwrap();

    let out = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let interrupting = InterruptingSource {
        inner: source.clone(),
        cancel: cancel.clone(),
        first_shard: out.path().join("data/shard-00000.parquet"),
        after: 5,
    };
    let err = compile_source(
        &config(out.path(), ""),
        Arc::new(interrupting),
        &CompileContext::with_builtins(),
        cancel,
    )
    .await
    .unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::Interrupted);

    let resumed = compile(&config(out.path(), "execution:\n  resume: true\n"), Arc::new(source))
        .await
        .unwrap();
    assert!(resumed.resumed);
    assert!(resumed.stats.episodes_skipped >= 2);
    assert_eq!(resumed.build_id, expected.build_id);
    assert_eq!(resumed.tally, expected.tally);
    assert_eq!(
        resumed.report.as_ref().unwrap().summary,
        expected.report.as_ref().unwrap().summary
    );

    let left = DatasetLayout::new(reference.path());
    let right = DatasetLayout::new(out.path());
    let key = |index: &EpisodeIndex| {
        index
            .records()
            .iter()
            .map(|r| (r.episode_id.clone(), r.split.clone(), r.invalid, r.data))
            .collect::<Vec<_>>()
    };
    assert_eq!(
        key(&EpisodeIndex::load(&left, Partition::Main).unwrap()),
        key(&EpisodeIndex::load(&right, Partition::Main).unwrap())
    );
    assert_eq!(
        read_stats(&left, Partition::Main).unwrap(),
        read_stats(&right, Partition::Main).unwrap()
    );
}

/// Holds back the episode at `after` until the first shard is on disk.
struct GatedSource {
    inner: MemorySource,
    first_shard: std::path::PathBuf,
    after: usize,
}

impl EpisodeSource for GatedSource {
    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn probe(&self) -> Result<DatasetSpec, SourceError> {
        self.inner.probe()
    }

    fn episodes(&self, selector: &Selector) -> Result<EpisodeIter<'_>, SourceError> {
        let iter = self.inner.episodes(selector)?.enumerate().map(move |(i, episode)| {
            if i == self.after {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !self.first_shard.exists() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            episode
        });
        Ok(Box::new(iter))
    }
}

#[tokio::test]
async fn test_resume_after_fail_fast_abort() {
    let episodes: Vec<Episode> = (0..5)
        .map(|i| if i == 2 { broken(&format!("ep-{i}")) } else { episode(&format!("ep-{i}"), 3) })
        .collect();
    let source = MemorySource::new(DatasetSpec::new("ds", "Synthetic"), episodes);

    let out = tempfile::tempdir().unwrap();
    let gated = GatedSource {
        inner: source.clone(),
        first_shard: out.path().join("data/shard-00000.parquet"),
        after: 2,
    };
    let err = compile(&config(out.path(), "validation:\n  fail_fast: true\n"), Arc::new(gated))
        .await
        .unwrap_err();
    assert!(matches!(err, CompileError::Aborted { ref episode_id, .. } if episode_id == "ep-2"));
    assert_eq!(err.exit_status(), ExitStatus::ValidationError);
    assert_eq!(err.exit_status().code(), 2);
    assert!(!out.path().join("meta/info.json").exists());

    let resumed = compile(&config(out.path(), "execution:\n  resume: true\n"), Arc::new(source))
        .await
        .unwrap();
    assert!(resumed.resumed);
    assert!(resumed.stats.episodes_skipped >= 2);
    assert_eq!(resumed.tally.accepted, 4);
    assert_eq!(resumed.tally.rejected, 1);
    assert_eq!(resumed.exit_status, ExitStatus::PartialFailure);

    let index = EpisodeIndex::load(&DatasetLayout::new(out.path()), Partition::Main).unwrap();
    assert_eq!(index.len(), 4);
    assert!(index.get("ep-2").is_none());
    assert!(verify_checksums(&DatasetLayout::new(out.path())).unwrap().is_empty());
}
