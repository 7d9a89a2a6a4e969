//! Episode source contract and the built-in canonical sources.
//!
//! Raw-format parsers live outside this crate; they hand over canonical
//! [`Episode`]s through [`EpisodeSource`]. [`JsonlSource`] reads episodes that
//! are already canonical (`spec.json` + `episodes.jsonl`), and
//! [`MemorySource`] serves tests.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use datakit_types::episode::Episode;
use datakit_types::spec::DatasetSpec;
use regex::Regex;

pub const SPEC_FILE: &str = "spec.json";
pub const DEFAULT_EPISODES_FILE: &str = "episodes.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record at {path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("invalid selector '{0}': expected [start:end], [start:], [:end] or [index]")]
    InvalidSelector(String),
}

pub type EpisodeIter<'a> = Box<dyn Iterator<Item = Result<Episode, SourceError>> + Send + 'a>;

/// Lazy, restartable producer of canonical episodes.
pub trait EpisodeSource: Send + Sync {
    /// Stable identity of the source, usually its URI.
    fn identity(&self) -> String;

    /// Source dataset version, if the source records one.
    fn version(&self) -> Option<String> {
        None
    }

    /// Read the dataset spec without touching episode data.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] when the dataset spec cannot be read.
    fn probe(&self) -> Result<DatasetSpec, SourceError>;

    /// Iterate episodes from the beginning, restricted to `selector`.
    /// Every call restarts the sequence.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] when the sequence cannot be opened.
    fn episodes(&self, selector: &Selector) -> Result<EpisodeIter<'_>, SourceError>;
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

static SELECTOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\s*(\d*)\s*(:?)\s*(\d*)\s*\]$").expect("selector regex is valid")
});

/// Half-open `[start, end)` range over source positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selector {
    pub start: usize,
    pub end: Option<usize>,
}

impl Selector {
    /// Everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse `[start:end]`, `[start:]`, `[:end]`, `[:]` or `[index]`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidSelector`] for anything else, including
    /// negative indices and `end < start`.
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let invalid = || SourceError::InvalidSelector(raw.to_string());
        let caps = SELECTOR_RE.captures(raw.trim()).ok_or_else(invalid)?;
        let number = |idx: usize| -> Result<Option<usize>, SourceError> {
            match caps.get(idx).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
                Some(digits) => digits.parse().map(Some).map_err(|_| invalid()),
                None => Ok(None),
            }
        };
        let start = number(1)?;
        let has_colon = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
        let end = number(3)?;

        let selector = if has_colon {
            Self {
                start: start.unwrap_or(0),
                end,
            }
        } else {
            let index = start.ok_or_else(invalid)?;
            Self {
                start: index,
                end: Some(index + 1),
            }
        };
        if selector.end.is_some_and(|end| end < selector.start) {
            return Err(invalid());
        }
        Ok(selector)
    }

    #[must_use]
    pub fn contains(&self, position: usize) -> bool {
        position >= self.start && self.end.map_or(true, |end| position < end)
    }

    /// Number of positions to take after skipping `start`.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.end.map_or(usize::MAX, |end| end - self.start)
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}:{end}]", self.start),
            None => write!(f, "[{}:]", self.start),
        }
    }
}

// ---------------------------------------------------------------------------
// JSONL source
// ---------------------------------------------------------------------------

/// Canonical episodes stored as one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    uri: String,
    dir: PathBuf,
    episodes_file: PathBuf,
}

impl JsonlSource {
    /// Open `dir`, preferring `{split}.jsonl` over `episodes.jsonl`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotFound`] if the directory, `spec.json` or the
    /// episode file is missing.
    pub fn open(uri: &str, split: &str) -> Result<Self, SourceError> {
        let dir = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        if !dir.is_dir() {
            return Err(SourceError::NotFound(uri.to_string()));
        }
        if !dir.join(SPEC_FILE).is_file() {
            return Err(SourceError::NotFound(dir.join(SPEC_FILE).display().to_string()));
        }
        let split_file = dir.join(format!("{split}.jsonl"));
        let episodes_file = if split_file.is_file() {
            split_file
        } else {
            dir.join(DEFAULT_EPISODES_FILE)
        };
        if !episodes_file.is_file() {
            return Err(SourceError::NotFound(episodes_file.display().to_string()));
        }
        Ok(Self {
            uri: uri.to_string(),
            dir,
            episodes_file,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl EpisodeSource for JsonlSource {
    fn identity(&self) -> String {
        self.uri.clone()
    }

    fn version(&self) -> Option<String> {
        self.probe()
            .ok()
            .and_then(|spec| spec.extra_metadata.get("version").and_then(|v| v.as_str().map(str::to_string)))
    }

    fn probe(&self) -> Result<DatasetSpec, SourceError> {
        let path = self.dir.join(SPEC_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|e| SourceError::Parse {
            path,
            line: e.line(),
            message: e.to_string(),
        })
    }

    fn episodes(&self, selector: &Selector) -> Result<EpisodeIter<'_>, SourceError> {
        let path = self.episodes_file.clone();
        let file = File::open(&path).map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        let records = BufReader::new(file)
            .lines()
            .enumerate()
            .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty()));
        let iter = records
            .enumerate()
            .skip(selector.start)
            .take(selector.limit())
            .map(move |(position, (line_no, line))| {
                let line = line.map_err(|source| SourceError::Io {
                    path: path.clone(),
                    source,
                })?;
                let mut episode: Episode =
                    serde_json::from_str(&line).map_err(|e| SourceError::Parse {
                        path: path.clone(),
                        line: line_no + 1,
                        message: e.to_string(),
                    })?;
                episode.source_episode_index = position as u64;
                Ok(episode)
            });
        Ok(Box::new(iter))
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// Serves a fixed episode list.
#[derive(Debug, Clone)]
pub struct MemorySource {
    spec: DatasetSpec,
    episodes: Vec<Episode>,
}

impl MemorySource {
    #[must_use]
    pub fn new(spec: DatasetSpec, episodes: Vec<Episode>) -> Self {
        Self { spec, episodes }
    }
}

impl EpisodeSource for MemorySource {
    fn identity(&self) -> String {
        format!("memory://{}", self.spec.dataset_id)
    }

    fn probe(&self) -> Result<DatasetSpec, SourceError> {
        Ok(self.spec.clone())
    }

    fn episodes(&self, selector: &Selector) -> Result<EpisodeIter<'_>, SourceError> {
        let iter = self
            .episodes
            .iter()
            .enumerate()
            .skip(selector.start)
            .take(selector.limit())
            .map(|(position, episode)| {
                let mut episode = episode.clone();
                episode.source_episode_index = position as u64;
                Ok(episode)
            });
        Ok(Box::new(iter))
    }
}

/// Open the built-in source for `uri`.
///
/// # Errors
///
/// Returns [`SourceError::NotFound`] when nothing exists at `uri`.
pub fn open_source(uri: &str, split: &str) -> Result<Box<dyn EpisodeSource>, SourceError> {
    Ok(Box::new(JsonlSource::open(uri, split)?))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use datakit_types::episode::Step;

    use super::*;

    fn episode(id: &str) -> Episode {
        let mut ep = Episode::new(id, "ds");
        ep.steps.push(Step::new(true, true, 0.0));
        ep
    }

    fn write_source(dir: &Path, ids: &[&str]) {
        let spec = DatasetSpec::new("ds", "Dataset");
        std::fs::write(dir.join(SPEC_FILE), serde_json::to_string(&spec).unwrap()).unwrap();
        let mut file = File::create(dir.join(DEFAULT_EPISODES_FILE)).unwrap();
        for id in ids {
            writeln!(file, "{}", serde_json::to_string(&episode(id)).unwrap()).unwrap();
            writeln!(file).unwrap();
        }
    }

    #[test]
    fn test_selector_forms() {
        assert_eq!(Selector::parse("[2:5]").unwrap(), Selector { start: 2, end: Some(5) });
        assert_eq!(Selector::parse("[3:]").unwrap(), Selector { start: 3, end: None });
        assert_eq!(Selector::parse("[:4]").unwrap(), Selector { start: 0, end: Some(4) });
        assert_eq!(Selector::parse("[:]").unwrap(), Selector::all());
        assert_eq!(Selector::parse("[7]").unwrap(), Selector { start: 7, end: Some(8) });
        assert_eq!(Selector::parse(" [ 1 : 2 ] ").unwrap(), Selector { start: 1, end: Some(2) });
    }

    #[test]
    fn test_selector_rejects_garbage() {
        for raw in ["", "[]", "[-1:]", "[5:2]", "1:2", "[a:b]"] {
            assert!(Selector::parse(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn test_selector_contains() {
        let s = Selector::parse("[2:4]").unwrap();
        assert!(!s.contains(1));
        assert!(s.contains(2));
        assert!(s.contains(3));
        assert!(!s.contains(4));
        assert_eq!(s.to_string(), "[2:4]");
    }

    #[test]
    fn test_memory_source_selection_keeps_positions() {
        let source = MemorySource::new(
            DatasetSpec::new("ds", "Dataset"),
            vec![episode("a"), episode("b"), episode("c")],
        );
        let selected: Vec<Episode> = source
            .episodes(&Selector::parse("[1:]").unwrap())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].episode_id, "b");
        assert_eq!(selected[0].source_episode_index, 1);
    }

    #[test]
    fn test_jsonl_source_reads_lazily() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), &["a", "b", "c"]);
        let source = JsonlSource::open(dir.path().to_str().unwrap(), "train").unwrap();
        assert_eq!(source.probe().unwrap().dataset_id, "ds");
        let ids: Vec<String> = source
            .episodes(&Selector::parse("[1:2]").unwrap())
            .unwrap()
            .map(|e| e.unwrap().episode_id)
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn test_jsonl_parse_error_has_line() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), &["a"]);
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(DEFAULT_EPISODES_FILE))
            .unwrap();
        writeln!(file, "{{not json").unwrap();
        let source = JsonlSource::open(dir.path().to_str().unwrap(), "train").unwrap();
        let results: Vec<_> = source.episodes(&Selector::all()).unwrap().collect();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(SourceError::Parse { line: 3, .. })));
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = open_source(missing.to_str().unwrap(), "train").err().unwrap();
        assert!(matches!(err, SourceError::NotFound(_)));

        let err = JsonlSource::open(dir.path().to_str().unwrap(), "train").unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }
}
